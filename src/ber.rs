//! BER to DER normalisation for CMS replies
//!
//! KMS encodes `CiphertextForRecipient` with a BER encoder: indefinite
//! lengths and constructed (chunked) OCTET STRINGs both show up. The `der`
//! crate only reads DER, so the reply is rewritten first:
//!
//! - indefinite lengths become definite, minimal lengths
//! - a constructed universal OCTET STRING becomes one primitive OCTET STRING
//! - a constructed `[0]` made only of OCTET STRING chunks becomes a primitive
//!   `[0]` (the implicitly tagged `encryptedContent` and
//!   `subjectKeyIdentifier` fields)
//!
//! DER input passes through unchanged.

use crate::error::{EnclaveError, Result};

const MAX_DEPTH: usize = 32;

const OCTET_STRING: u8 = 0x04;
const OCTET_STRING_CONSTRUCTED: u8 = 0x24;
const CONTEXT_0_PRIMITIVE: u8 = 0x80;
const CONTEXT_0_CONSTRUCTED: u8 = 0xa0;
const CONSTRUCTED_BIT: u8 = 0x20;

#[derive(Debug)]
enum Body {
    Primitive(Vec<u8>),
    Constructed(Vec<Element>),
}

#[derive(Debug)]
struct Element {
    identifier: Vec<u8>,
    body: Body,
}

/// Rewrites one BER element (and nothing after it) as DER
pub fn to_der(input: &[u8]) -> Result<Vec<u8>> {
    let (element, used) = read_element(input, 0)?;
    if used != input.len() {
        return Err(malformed("trailing bytes after element"));
    }
    let mut out = Vec::with_capacity(input.len());
    write_element(&normalize(element), &mut out);
    Ok(out)
}

fn malformed(detail: &str) -> EnclaveError {
    EnclaveError::Recipient(format!("Invalid BER: {}", detail))
}

enum Length {
    Definite(usize),
    Indefinite,
}

fn read_element(input: &[u8], depth: usize) -> Result<(Element, usize)> {
    if depth > MAX_DEPTH {
        return Err(malformed("nesting too deep"));
    }

    let first = *input.first().ok_or_else(|| malformed("truncated identifier"))?;
    let mut pos = 1;
    if first & 0x1f == 0x1f {
        loop {
            let byte = *input.get(pos).ok_or_else(|| malformed("truncated tag"))?;
            pos += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }
    }
    let identifier = input[..pos].to_vec();
    let constructed = first & CONSTRUCTED_BIT != 0;

    let (length, header_len) = read_length(&input[pos..])?;
    pos += header_len;

    match length {
        Length::Definite(len) => {
            let end = pos
                .checked_add(len)
                .filter(|end| *end <= input.len())
                .ok_or_else(|| malformed("length exceeds input"))?;
            let content = &input[pos..end];
            let body = if constructed {
                let mut children = Vec::new();
                let mut offset = 0;
                while offset < content.len() {
                    let (child, used) = read_element(&content[offset..], depth + 1)?;
                    children.push(child);
                    offset += used;
                }
                Body::Constructed(children)
            } else {
                Body::Primitive(content.to_vec())
            };
            Ok((Element { identifier, body }, end))
        }
        Length::Indefinite => {
            if !constructed {
                return Err(malformed("indefinite length on primitive"));
            }
            let mut children = Vec::new();
            loop {
                let rest = &input[pos..];
                if rest.starts_with(&[0, 0]) {
                    pos += 2;
                    break;
                }
                if rest.is_empty() {
                    return Err(malformed("missing end-of-contents"));
                }
                let (child, used) = read_element(rest, depth + 1)?;
                children.push(child);
                pos += used;
            }
            Ok((
                Element {
                    identifier,
                    body: Body::Constructed(children),
                },
                pos,
            ))
        }
    }
}

fn read_length(input: &[u8]) -> Result<(Length, usize)> {
    let first = *input.first().ok_or_else(|| malformed("truncated length"))?;
    if first < 0x80 {
        return Ok((Length::Definite(first as usize), 1));
    }
    if first == 0x80 {
        return Ok((Length::Indefinite, 1));
    }

    let count = (first & 0x7f) as usize;
    if count > 4 {
        return Err(malformed("length too large"));
    }
    let bytes = input
        .get(1..1 + count)
        .ok_or_else(|| malformed("truncated length"))?;
    let len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Ok((Length::Definite(len), 1 + count))
}

fn normalize(element: Element) -> Element {
    let Element { identifier, body } = element;
    let children = match body {
        Body::Primitive(content) => {
            return Element {
                identifier,
                body: Body::Primitive(content),
            }
        }
        Body::Constructed(children) => children.into_iter().map(normalize).collect::<Vec<_>>(),
    };

    let flattened_tag = match identifier.as_slice() {
        [OCTET_STRING_CONSTRUCTED] => Some(OCTET_STRING),
        [CONTEXT_0_CONSTRUCTED] if !children.is_empty() => Some(CONTEXT_0_PRIMITIVE),
        _ => None,
    };

    match flattened_tag {
        Some(tag) if children.iter().all(is_octet_string) => {
            let mut content = Vec::new();
            for child in children {
                if let Body::Primitive(chunk) = child.body {
                    content.extend_from_slice(&chunk);
                }
            }
            Element {
                identifier: vec![tag],
                body: Body::Primitive(content),
            }
        }
        _ => Element {
            identifier,
            body: Body::Constructed(children),
        },
    }
}

fn is_octet_string(element: &Element) -> bool {
    element.identifier == [OCTET_STRING] && matches!(element.body, Body::Primitive(_))
}

fn write_element(element: &Element, out: &mut Vec<u8>) {
    out.extend_from_slice(&element.identifier);
    match &element.body {
        Body::Primitive(content) => {
            write_length(content.len(), out);
            out.extend_from_slice(content);
        }
        Body::Constructed(children) => {
            let mut content = Vec::new();
            for child in children {
                write_element(child, &mut content);
            }
            write_length(content.len(), out);
            out.extend_from_slice(&content);
        }
    }
}

fn write_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}
