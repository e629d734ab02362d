//! Primary-header keyword stamping for FITS files.
//!
//! Only the primary header is touched. A header is a run of 2880-byte
//! blocks of 80-column ASCII cards ending in an `END` card; data follows on
//! the next block boundary and is carried over byte for byte.
use crate::sysexit::MemoryExhausted;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

pub const BLOCK_SIZE: usize = 2880;
pub const CARD_SIZE: usize = 80;
const CARDS_PER_BLOCK: usize = BLOCK_SIZE / CARD_SIZE;

#[derive(Debug, Clone, PartialEq)]
pub enum CardValue {
    Str(String),
    Int(i64),
}

impl CardValue {
    fn render(&self) -> String {
        match self {
            CardValue::Str(text) => {
                let escaped = text.replace('\'', "''");
                format!("'{escaped:<8}'")
            }
            CardValue::Int(value) => format!("{value:>20}"),
        }
    }
}

/// Render one header card.
pub fn format_card(keyword: &str, value: &CardValue) -> Result<String> {
    let keyword = keyword.to_ascii_uppercase();
    if keyword.is_empty()
        || keyword.len() > 8
        || !keyword
            .chars()
            .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '-' || ch == '_')
    {
        return Err(anyhow!("invalid FITS keyword {keyword:?}"));
    }
    let card = format!("{keyword:<8}= {}", value.render());
    if !card.is_ascii() || card.len() > CARD_SIZE {
        return Err(anyhow!("value for {keyword} does not fit in one card"));
    }
    Ok(format!("{card:<CARD_SIZE$}"))
}

fn card_keyword(card: &[u8]) -> &str {
    std::str::from_utf8(&card[..8]).unwrap_or_default().trim_end()
}

/// Index of the `END` card in the primary header, in cards.
fn find_end(bytes: &[u8]) -> Result<usize> {
    if bytes.len() < CARD_SIZE || !bytes.starts_with(b"SIMPLE  =") {
        return Err(anyhow!("not a FITS file: first card is not SIMPLE"));
    }
    bytes
        .chunks(CARD_SIZE)
        .position(|card| card.len() == CARD_SIZE && card_keyword(card) == "END")
        .ok_or_else(|| anyhow!("primary header has no END card"))
}

/// Set `updates` in the primary header of the FITS file at `path`,
/// replacing existing cards of the same keyword.
///
/// The file is rewritten through a temp file in the same directory, so a
/// failure leaves the original untouched.
pub fn set_keywords(path: &Path, updates: &[(&str, CardValue)]) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let end = find_end(&bytes).with_context(|| format!("parse {}", path.display()))?;
    let header_blocks = end / CARDS_PER_BLOCK + 1;
    let data = &bytes[(header_blocks * BLOCK_SIZE).min(bytes.len())..];

    let mut cards: Vec<String> = bytes[..end * CARD_SIZE]
        .chunks(CARD_SIZE)
        .map(|card| String::from_utf8_lossy(card).into_owned())
        .collect();
    for (keyword, value) in updates {
        let card = format_card(keyword, value)?;
        let keyword = keyword.to_ascii_uppercase();
        match cards
            .iter()
            .position(|existing| card_keyword(existing.as_bytes()) == keyword)
        {
            Some(index) => cards[index] = card,
            None => cards.push(card),
        }
    }
    cards.push(format!("{:<CARD_SIZE$}", "END"));

    let mut header = cards.concat().into_bytes();
    let padded = header.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    header.resize(padded, b' ');

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    let mut image = Vec::new();
    image
        .try_reserve_exact(header.len() + data.len())
        .map_err(|err| MemoryExhausted::from_reserve(format!("image of {}", path.display()), err))?;
    image.extend_from_slice(&header);
    image.extend_from_slice(data);
    tmp.write_all(&image)
        .with_context(|| format!("write {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Raw value text of `keyword` in the primary header, without comment.
#[cfg(test)]
pub fn read_keyword(path: &Path, keyword: &str) -> Result<Option<String>> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let end = find_end(&bytes).with_context(|| format!("parse {}", path.display()))?;
    let keyword = keyword.to_ascii_uppercase();
    for card in bytes[..end * CARD_SIZE].chunks(CARD_SIZE) {
        if card_keyword(card) != keyword || &card[8..10] != b"= " {
            continue;
        }
        let text = String::from_utf8_lossy(&card[10..]).into_owned();
        let value = if let Some(rest) = text.trim_start().strip_prefix('\'') {
            let mut value = String::new();
            let mut chars = rest.chars().peekable();
            while let Some(ch) = chars.next() {
                if ch == '\'' {
                    if chars.peek() == Some(&'\'') {
                        value.push('\'');
                        chars.next();
                        continue;
                    }
                    break;
                }
                value.push(ch);
            }
            value.trim_end().to_string()
        } else {
            text.split('/').next().unwrap_or_default().trim().to_string()
        };
        return Ok(Some(value));
    }
    Ok(None)
}

/// Bytes of a minimal FITS file: a primary header with `cards` and a data
/// unit of `data_blocks` zero-filled blocks.
#[cfg(test)]
pub fn minimal_file(cards: &[(&str, CardValue)], data_blocks: usize) -> Result<Vec<u8>> {
    let mut header = String::new();
    header.push_str(&format!("{:<CARD_SIZE$}", format!("SIMPLE  = {:>20}", "T")));
    header.push_str(&format_card("BITPIX", &CardValue::Int(8))?);
    header.push_str(&format_card("NAXIS", &CardValue::Int(0))?);
    for (keyword, value) in cards {
        header.push_str(&format_card(keyword, value)?);
    }
    header.push_str(&format!("{:<CARD_SIZE$}", "END"));
    let mut bytes = header.into_bytes();
    let padded = bytes.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    bytes.resize(padded, b' ');
    bytes.resize(padded + data_blocks * BLOCK_SIZE, 0);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cards_follow_fixed_format() {
        assert_eq!(
            format_card("CSYS_VER", &CardValue::Str("caldp_2024".to_string())).expect("card"),
            format!("{:<80}", "CSYS_VER= 'caldp_2024'")
        );
        assert_eq!(
            format_card("randseed", &CardValue::Int(1)).expect("card"),
            format!("{:<80}", "RANDSEED=                    1")
        );
        assert_eq!(
            format_card("CALDPVER", &CardValue::Str("0.1".to_string())).expect("card"),
            format!("{:<80}", "CALDPVER= '0.1     '")
        );
        assert!(format_card("TOOLONGKEY", &CardValue::Int(1)).is_err());
    }

    #[test]
    fn set_keywords_adds_and_replaces_preserving_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("j8cb01u3q_raw.fits");
        let mut bytes = minimal_file(&[("CSYS_VER", CardValue::Str("old".to_string()))], 1)
            .expect("fits");
        let data_start = bytes.len() - BLOCK_SIZE;
        bytes[data_start] = 42;
        fs::write(&path, &bytes).expect("write");

        set_keywords(
            &path,
            &[
                ("CSYS_VER", CardValue::Str("caldp_2024".to_string())),
                ("CALDPVER", CardValue::Str("0.1.0".to_string())),
            ],
        )
        .expect("set");

        assert_eq!(
            read_keyword(&path, "CSYS_VER").expect("read"),
            Some("caldp_2024".to_string())
        );
        assert_eq!(
            read_keyword(&path, "caldpver").expect("read"),
            Some("0.1.0".to_string())
        );
        assert_eq!(read_keyword(&path, "RANDSEED").expect("read"), None);
        let rewritten = fs::read(&path).expect("read back");
        assert_eq!(rewritten.len(), bytes.len());
        assert_eq!(rewritten[rewritten.len() - BLOCK_SIZE], 42);
    }

    #[test]
    fn header_grows_by_a_block_when_full() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("full.fits");
        let filler: Vec<(String, CardValue)> = (0..32)
            .map(|index| (format!("KEY{index}"), CardValue::Int(index)))
            .collect();
        let cards: Vec<(&str, CardValue)> = filler
            .iter()
            .map(|(key, value)| (key.as_str(), value.clone()))
            .collect();
        let bytes = minimal_file(&cards, 0).expect("fits");
        assert_eq!(bytes.len(), BLOCK_SIZE);
        fs::write(&path, &bytes).expect("write");

        set_keywords(&path, &[("RANDSEED", CardValue::Int(1))]).expect("set");
        let rewritten = fs::read(&path).expect("read back");
        assert_eq!(rewritten.len(), 2 * BLOCK_SIZE);
        assert_eq!(
            read_keyword(&path, "RANDSEED").expect("read"),
            Some("1".to_string())
        );
        assert_eq!(read_keyword(&path, "KEY31").expect("read"), Some("31".to_string()));
    }

    #[test]
    fn non_fits_input_is_rejected_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("notes_raw.fits");
        fs::write(&path, b"plain text").expect("write");
        assert!(set_keywords(&path, &[("RANDSEED", CardValue::Int(1))]).is_err());
        assert_eq!(fs::read(&path).expect("read"), b"plain text");
    }
}
