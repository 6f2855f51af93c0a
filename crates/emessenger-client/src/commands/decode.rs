//! Decode command: hex frame in, JSON out.

use emessenger_protocol::Packet;

use crate::error::{ClientError, ClientResult};

/// Decodes the frame spelled by `parts` and prints it.
pub fn run(parts: &[String]) -> ClientResult<()> {
    println!("{}", render(parts)?);
    Ok(())
}

/// Decodes the frame spelled by `parts` into pretty JSON.
pub fn render(parts: &[String]) -> ClientResult<String> {
    let frame = parse_hex(&parts.join(""))?;
    let packet = Packet::decode(&frame)?;
    serde_json::to_string_pretty(&packet)
        .map_err(|e| ClientError::Config(format!("failed to serialize packet: {}", e)))
}

/// Parses hex digits, ignoring whitespace, `:` separators and a `0x` prefix.
fn parse_hex(input: &str) -> ClientResult<Vec<u8>> {
    let input = input.strip_prefix("0x").unwrap_or(input);
    let digits: Vec<u8> = input
        .bytes()
        .filter(|b| !b.is_ascii_whitespace() && *b != b':')
        .collect();

    if digits.len() % 2 != 0 {
        return Err(ClientError::Config(format!(
            "odd number of hex digits ({})",
            digits.len()
        )));
    }

    digits
        .chunks(2)
        .map(|pair| Ok((nibble(pair[0])? << 4) | nibble(pair[1])?))
        .collect()
}

fn nibble(digit: u8) -> ClientResult<u8> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        other => Err(ClientError::Config(format!(
            "invalid hex digit {:?}",
            other as char
        ))),
    }
}
