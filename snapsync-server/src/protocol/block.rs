use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Largest single token accepted from a peer
pub const MAX_TOKEN_SIZE: usize = 64 * 1024 * 1024;

/// Errors raised while parsing a block
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid token length header: {0:?}")]
    InvalidLength(String),

    #[error("Token of {0} bytes exceeds the maximum size")]
    TokenTooLarge(usize),

    #[error("Missing newline after token")]
    MissingTerminator,
}

/// Append one block: every token as `<len>\n<bytes>\n`, then an empty line
pub fn encode_block<I, T>(out: &mut BytesMut, tokens: I)
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    for token in tokens {
        let token = token.as_ref();
        out.extend_from_slice(token.len().to_string().as_bytes());
        out.extend_from_slice(b"\n");
        out.extend_from_slice(token);
        out.extend_from_slice(b"\n");
    }
    out.extend_from_slice(b"\n");
}

/// Parse one complete block from the front of `input`
///
/// Returns `Ok(None)` and leaves `input` untouched when the block is not
/// complete yet. Blank lines before the first token are skipped.
pub fn parse_block(input: &mut BytesMut) -> Result<Option<Vec<Bytes>>, ProtocolError> {
    let leading = input
        .iter()
        .take_while(|b| **b == b'\n' || **b == b'\r')
        .count();
    input.advance(leading);

    let mut pos = 0;
    let mut spans = Vec::new();

    loop {
        let rest = &input[pos..];
        if rest.is_empty() {
            return Ok(None);
        }

        match rest[0] {
            b'\n' => {
                pos += 1;
                break;
            }
            b'\r' => {
                if rest.len() < 2 {
                    return Ok(None);
                }
                if rest[1] != b'\n' {
                    return Err(ProtocolError::MissingTerminator);
                }
                pos += 2;
                break;
            }
            _ => {}
        }

        let Some(newline) = rest.iter().position(|b| *b == b'\n') else {
            if rest.len() > 20 {
                return Err(ProtocolError::InvalidLength(
                    String::from_utf8_lossy(&rest[..20]).into_owned(),
                ));
            }
            return Ok(None);
        };

        let header = &rest[..newline];
        let header = header.strip_suffix(b"\r").unwrap_or(header);
        let len: usize = std::str::from_utf8(header)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| {
                ProtocolError::InvalidLength(String::from_utf8_lossy(header).into_owned())
            })?;
        if len > MAX_TOKEN_SIZE {
            return Err(ProtocolError::TokenTooLarge(len));
        }

        let start = pos + newline + 1;
        let end = start + len;
        if input.len() <= end {
            return Ok(None);
        }

        let terminator = match input[end] {
            b'\n' => 1,
            b'\r' => {
                if input.len() <= end + 1 {
                    return Ok(None);
                }
                if input[end + 1] != b'\n' {
                    return Err(ProtocolError::MissingTerminator);
                }
                2
            }
            _ => return Err(ProtocolError::MissingTerminator),
        };

        spans.push((start, end));
        pos = end + terminator;
    }

    let block = input.split_to(pos).freeze();
    Ok(Some(
        spans
            .into_iter()
            .map(|(start, end)| block.slice(start..end))
            .collect(),
    ))
}
