//! Quorum descriptor text: `tr(KEY,multi_a(M,KEY,...))#checksum`

use crate::{Error, Result};

const INPUT_CHARSET: &str =
    "0123456789()[],'/*abcdefgh@:$%{}IJKLMNOPQRSTUVWXYZ&+-.;<=>?!^_|~ijklmnopqrstuvwxyzABCDEFGH`#\"\\ ";
const CHECKSUM_CHARSET: &[u8] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const GENERATOR: [u64; 5] = [
    0xf5dee51989,
    0xa9fdca3312,
    0x1bab10e32d,
    0x3706b1677a,
    0x644d626ffd,
];

fn polymod(symbols: impl IntoIterator<Item = u64>) -> u64 {
    let mut chk: u64 = 1;
    for value in symbols {
        let top = chk >> 35;
        chk = ((chk & 0x7ffffffff) << 5) ^ value;
        for (i, generator) in GENERATOR.iter().enumerate() {
            if (top >> i) & 1 == 1 {
                chk ^= generator;
            }
        }
    }
    chk
}

fn expand(desc: &str) -> Result<Vec<u64>> {
    let mut symbols = Vec::with_capacity(desc.len() + desc.len() / 3 + 1);
    let mut groups = Vec::with_capacity(3);

    for c in desc.chars() {
        let v = INPUT_CHARSET
            .find(c)
            .ok_or_else(|| Error::InvalidDescriptor(format!("invalid character '{}'", c)))?
            as u64;
        symbols.push(v & 31);
        groups.push(v >> 5);
        if groups.len() == 3 {
            symbols.push(groups[0] * 9 + groups[1] * 3 + groups[2]);
            groups.clear();
        }
    }
    match groups.len() {
        1 => symbols.push(groups[0]),
        2 => symbols.push(groups[0] * 3 + groups[1]),
        _ => {}
    }
    Ok(symbols)
}

/// BIP380 descriptor checksum (8 characters)
pub fn descriptor_checksum(desc: &str) -> Result<String> {
    let mut symbols = expand(desc)?;
    symbols.extend([0u64; 8]);
    let checksum = polymod(symbols) ^ 1;

    Ok((0..8)
        .map(|i| CHECKSUM_CHARSET[((checksum >> (5 * (7 - i))) & 31) as usize] as char)
        .collect())
}

/// Append `#checksum` to a descriptor body
pub fn with_checksum(desc: &str) -> Result<String> {
    Ok(format!("{}#{}", desc, descriptor_checksum(desc)?))
}

/// Split off and verify an optional checksum, returning the body
pub fn strip_checksum(text: &str) -> Result<&str> {
    match text.split_once('#') {
        None => Ok(text),
        Some((body, checksum)) => {
            if checksum.len() != 8 {
                return Err(Error::InvalidDescriptor(format!(
                    "expected 8 character checksum, not {} characters",
                    checksum.len()
                )));
            }
            let expected = descriptor_checksum(body)?;
            if expected != checksum {
                return Err(Error::InvalidDescriptor(format!(
                    "provided checksum '{}' does not match computed checksum '{}'",
                    checksum, expected
                )));
            }
            Ok(body)
        }
    }
}

/// Key expressions and threshold of a quorum descriptor body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorParts<'a> {
    pub internal: &'a str,
    pub threshold: usize,
    pub keys: Vec<&'a str>,
}

/// Split `tr(KEY,multi_a(M,KEY,...))` into its parts
pub fn parse_parts(body: &str) -> Result<DescriptorParts<'_>> {
    let inner = body
        .strip_prefix("tr(")
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| {
            Error::InvalidDescriptor(format!("'{}' is not a valid descriptor function", body))
        })?;

    let (internal, leaf) = inner.split_once(',').ok_or_else(|| {
        Error::InvalidDescriptor("tr() descriptor must commit to a multi_a leaf".into())
    })?;

    let args = leaf
        .strip_prefix("multi_a(")
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| {
            Error::InvalidDescriptor(format!("tr(): '{}' is not a multi_a leaf", leaf))
        })?;

    let mut fields = args.split(',');
    let threshold_text = fields.next().unwrap_or_default();
    let threshold = threshold_text.parse::<usize>().map_err(|_| {
        Error::InvalidDescriptor(format!(
            "multi_a(): threshold '{}' is not a number",
            threshold_text
        ))
    })?;
    let keys: Vec<&str> = fields.collect();

    Ok(DescriptorParts {
        internal,
        threshold,
        keys,
    })
}

/// Render a descriptor body (without checksum)
pub fn render<S: AsRef<str>>(internal: &str, threshold: usize, keys: &[S]) -> String {
    let mut desc = format!("tr({},multi_a({}", internal, threshold);
    for key in keys {
        desc.push(',');
        desc.push_str(key.as_ref());
    }
    desc.push_str("))");
    desc
}
