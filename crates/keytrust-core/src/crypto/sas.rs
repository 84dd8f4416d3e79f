//! Short authentication string derivation and rendering

use core::fmt;

use hkdf::Hkdf;
use sha2::Sha256;

use crate::errors::CryptographicError;

/// Leading component of the SAS HKDF info string
pub const SAS_INFO_PREFIX: &str = "MATRIX_KEY_VERIFICATION_SAS";

/// One slot of the SAS info string
#[derive(Debug, Clone, Copy)]
pub struct SasParticipant<'a> {
    pub user_id: &'a str,
    pub device_id: &'a str,
    pub public_key: &'a str,
}

/// Build the HKDF info string
///
/// `start` is the side whose `start` message was used, `accept` the side that
/// answered it. Slots follow protocol roles, never local identity.
pub fn derive_sas_info(
    start: SasParticipant<'_>,
    accept: SasParticipant<'_>,
    transaction_id: &str,
) -> String {
    [
        SAS_INFO_PREFIX,
        start.user_id,
        start.device_id,
        start.public_key,
        accept.user_id,
        accept.device_id,
        accept.public_key,
        transaction_id,
    ]
    .join("|")
}

/// HKDF-SHA256 with an empty salt
pub fn derive_sas_bytes(
    shared_secret: &[u8],
    info: &str,
    length: usize,
) -> Result<Vec<u8>, CryptographicError> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut out = vec![0u8; length];
    hk.expand(info.as_bytes(), &mut out)
        .map_err(|_| CryptographicError::KeyDerivationFailed)?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// Decimal Rendering
// ----------------------------------------------------------------------------

/// Three numbers in `1000..=9191`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecimalSas(pub [u16; 3]);

/// Pack 5 bytes into three 13-bit numbers offset by 1000
pub fn format_decimal_sas(bytes: &[u8]) -> Result<DecimalSas, CryptographicError> {
    let [b0, b1, b2, b3, b4]: [u8; 5] =
        bytes
            .try_into()
            .map_err(|_| CryptographicError::InvalidSasLength {
                expected: 5,
                actual: bytes.len(),
            })?;
    let (b0, b1, b2, b3, b4) = (b0 as u16, b1 as u16, b2 as u16, b3 as u16, b4 as u16);

    let n1 = ((b0 << 5) | (b1 >> 3)) + 1000;
    let n2 = (((b1 & 0x7) << 10) | (b2 << 2) | (b3 >> 6)) + 1000;
    let n3 = (((b3 & 0x3f) << 7) | (b4 >> 1)) + 1000;
    Ok(DecimalSas([n1, n2, n3]))
}

impl fmt::Display for DecimalSas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "{a:04} {b:04} {c:04}")
    }
}

// ----------------------------------------------------------------------------
// Emoji Rendering
// ----------------------------------------------------------------------------

/// An entry of the emoji table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SasEmoji {
    pub emoji: &'static str,
    pub description: &'static str,
}

const fn e(emoji: &'static str, description: &'static str) -> SasEmoji {
    SasEmoji { emoji, description }
}

/// The 64-entry table, indexed by 6-bit value
pub const SAS_EMOJI_TABLE: [SasEmoji; 64] = [
    e("\u{1F436}", "Dog"),
    e("\u{1F431}", "Cat"),
    e("\u{1F981}", "Lion"),
    e("\u{1F40E}", "Horse"),
    e("\u{1F984}", "Unicorn"),
    e("\u{1F437}", "Pig"),
    e("\u{1F418}", "Elephant"),
    e("\u{1F430}", "Rabbit"),
    e("\u{1F43C}", "Panda"),
    e("\u{1F413}", "Rooster"),
    e("\u{1F427}", "Penguin"),
    e("\u{1F422}", "Turtle"),
    e("\u{1F41F}", "Fish"),
    e("\u{1F419}", "Octopus"),
    e("\u{1F98B}", "Butterfly"),
    e("\u{1F337}", "Flower"),
    e("\u{1F333}", "Tree"),
    e("\u{1F335}", "Cactus"),
    e("\u{1F344}", "Mushroom"),
    e("\u{1F30F}", "Globe"),
    e("\u{1F319}", "Moon"),
    e("\u{2601}\u{FE0F}", "Cloud"),
    e("\u{1F525}", "Fire"),
    e("\u{1F34C}", "Banana"),
    e("\u{1F34E}", "Apple"),
    e("\u{1F353}", "Strawberry"),
    e("\u{1F33D}", "Corn"),
    e("\u{1F355}", "Pizza"),
    e("\u{1F382}", "Cake"),
    e("\u{2764}\u{FE0F}", "Heart"),
    e("\u{1F600}", "Smiley"),
    e("\u{1F916}", "Robot"),
    e("\u{1F3A9}", "Hat"),
    e("\u{1F453}", "Glasses"),
    e("\u{1F527}", "Spanner"),
    e("\u{1F385}", "Santa"),
    e("\u{1F44D}", "Thumbs Up"),
    e("\u{2602}\u{FE0F}", "Umbrella"),
    e("\u{231B}", "Hourglass"),
    e("\u{23F0}", "Clock"),
    e("\u{1F381}", "Gift"),
    e("\u{1F4A1}", "Light Bulb"),
    e("\u{1F4D5}", "Book"),
    e("\u{270F}\u{FE0F}", "Pencil"),
    e("\u{1F4CE}", "Paperclip"),
    e("\u{2702}\u{FE0F}", "Scissors"),
    e("\u{1F512}", "Lock"),
    e("\u{1F511}", "Key"),
    e("\u{1F528}", "Hammer"),
    e("\u{260E}\u{FE0F}", "Telephone"),
    e("\u{1F3C1}", "Flag"),
    e("\u{1F682}", "Train"),
    e("\u{1F6B2}", "Bicycle"),
    e("\u{2708}\u{FE0F}", "Aeroplane"),
    e("\u{1F680}", "Rocket"),
    e("\u{1F3C6}", "Trophy"),
    e("\u{26BD}", "Ball"),
    e("\u{1F3B8}", "Guitar"),
    e("\u{1F3BA}", "Trumpet"),
    e("\u{1F514}", "Bell"),
    e("\u{2693}", "Anchor"),
    e("\u{1F3A7}", "Headphones"),
    e("\u{1F4C1}", "Folder"),
    e("\u{1F4CC}", "Pin"),
];

/// Seven emoji picked from the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmojiSas(pub [SasEmoji; 7]);

impl EmojiSas {
    pub fn indices(&self) -> [usize; 7] {
        self.0.map(|entry| {
            SAS_EMOJI_TABLE
                .iter()
                .position(|candidate| *candidate == entry)
                .unwrap_or(0)
        })
    }
}

/// Read 6 bytes as a 48-bit big-endian number and take seven 6-bit indices, high bits first
pub fn format_emoji_sas(bytes: &[u8]) -> Result<EmojiSas, CryptographicError> {
    if bytes.len() != 6 {
        return Err(CryptographicError::InvalidSasLength {
            expected: 6,
            actual: bytes.len(),
        });
    }
    let num = bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
    let mut out = [SAS_EMOJI_TABLE[0]; 7];
    for (i, slot) in out.iter_mut().enumerate() {
        let index = (num >> (48 - 6 * (i + 1))) & 0x3f;
        *slot = SAS_EMOJI_TABLE[index as usize];
    }
    Ok(EmojiSas(out))
}

impl fmt::Display for EmojiSas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{} {}", entry.emoji, entry.description)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(sas: &EmojiSas) -> Vec<&'static str> {
        sas.0.iter().map(|entry| entry.description).collect()
    }

    #[test]
    fn test_decimal_extremes() {
        assert_eq!(format_decimal_sas(&[0; 5]).unwrap().0, [1000, 1000, 1000]);
        assert_eq!(format_decimal_sas(&[0xff; 5]).unwrap().0, [9191, 9191, 9191]);
    }

    #[test]
    fn test_decimal_golden_vector() {
        let sas = format_decimal_sas(&[0x12, 0x34, 0x56, 0x78, 0x9a]).unwrap();
        assert_eq!(sas.0, [1582, 5441, 8245]);
        assert_eq!(sas.to_string(), "1582 5441 8245");
    }

    #[test]
    fn test_decimal_requires_exactly_five_bytes() {
        assert_eq!(
            format_decimal_sas(&[1, 2, 3, 4]),
            Err(CryptographicError::InvalidSasLength {
                expected: 5,
                actual: 4
            })
        );
        assert!(format_decimal_sas(&[1, 2, 3, 4, 5, 6]).is_err());
    }

    #[test]
    fn test_emoji_golden_vector() {
        let sas = format_emoji_sas(&[0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]).unwrap();
        assert_eq!(sas.indices(), [4, 35, 17, 22, 30, 9, 42]);
        assert_eq!(
            names(&sas),
            ["Unicorn", "Santa", "Cactus", "Fire", "Smiley", "Rooster", "Book"]
        );
    }

    #[test]
    fn test_emoji_extremes_and_format() {
        let zeros = format_emoji_sas(&[0; 6]).unwrap();
        assert_eq!(names(&zeros), ["Dog"; 7]);
        let ones = format_emoji_sas(&[0xff; 6]).unwrap();
        assert_eq!(names(&ones), ["Pin"; 7]);

        let rendered = zeros.to_string();
        assert!(rendered.starts_with("\u{1F436} Dog | "));
        assert_eq!(rendered.matches(" | ").count(), 6);
    }

    #[test]
    fn test_emoji_table_uses_wire_descriptions() {
        assert_eq!(SAS_EMOJI_TABLE[30].description, "Smiley");
        assert_eq!(SAS_EMOJI_TABLE[36].description, "Thumbs Up");
        assert_eq!(SAS_EMOJI_TABLE[41].description, "Light Bulb");
        assert_eq!(SAS_EMOJI_TABLE[63].description, "Pin");
    }

    #[test]
    fn test_emoji_requires_exactly_six_bytes() {
        assert!(format_emoji_sas(&[0; 5]).is_err());
        assert!(format_emoji_sas(&[0; 7]).is_err());
    }

    #[test]
    fn test_hkdf_golden_vector() {
        let bytes = derive_sas_bytes(&[0u8; 32], "MATRIX_KEY_VERIFICATION_SAS|test", 6).unwrap();
        assert_eq!(bytes, [0xff, 0x3b, 0x79, 0xa9, 0x00, 0xd7]);
        let five = derive_sas_bytes(&[0u8; 32], "MATRIX_KEY_VERIFICATION_SAS|test", 5).unwrap();
        assert_eq!(five, bytes[..5]);
    }

    #[test]
    fn test_info_string_uses_role_slots() {
        let start = SasParticipant {
            user_id: "@a:x",
            device_id: "D1",
            public_key: "k1",
        };
        let accept = SasParticipant {
            user_id: "@a:x",
            device_id: "D2",
            public_key: "k2",
        };
        assert_eq!(
            derive_sas_info(start, accept, "txn"),
            "MATRIX_KEY_VERIFICATION_SAS|@a:x|D1|k1|@a:x|D2|k2|txn"
        );
    }
}
