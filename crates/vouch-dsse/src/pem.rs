//! PEM armor and fixed-layout SPKI encoders.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

const BEGIN: &str = "-----BEGIN ";
const END: &str = "-----END ";
const LINE_WIDTH: usize = 64;

/// Armor `der` as a PEM block labelled `label`.
#[must_use]
pub fn der_to_pem(der: &[u8], label: &str) -> String {
    let body = BASE64.encode(der);
    let mut pem = String::with_capacity(body.len() + body.len() / LINE_WIDTH + 2 * label.len() + 40);
    pem.push_str(BEGIN);
    pem.push_str(label);
    pem.push_str("-----\n");
    let mut rest = body.as_str();
    while !rest.is_empty() {
        // base64 output is ASCII, so any byte index is a char boundary.
        let (line, tail) = rest.split_at(rest.len().min(LINE_WIDTH));
        pem.push_str(line);
        pem.push('\n');
        rest = tail;
    }
    pem.push_str(END);
    pem.push_str(label);
    pem.push_str("-----\n");
    pem
}

/// DER of the first decodable PEM block.
#[must_use]
pub fn pem_to_der(pem: &str) -> Option<Vec<u8>> {
    pem_blocks(pem).into_iter().next()
}

/// DER of every PEM block, in document order.
///
/// Blocks that are unterminated or not valid base64 are skipped.
#[must_use]
pub fn pem_blocks(pem: &str) -> Vec<Vec<u8>> {
    let mut blocks = Vec::new();
    let mut body: Option<String> = None;

    for line in pem.lines().map(str::trim) {
        if line.starts_with(BEGIN) {
            body = Some(String::new());
        } else if line.starts_with(END) {
            if let Some(text) = body.take() {
                match BASE64.decode(text) {
                    Ok(der) => blocks.push(der),
                    Err(e) => tracing::debug!(error = %e, "skipping undecodable PEM block"),
                }
            }
        } else if let Some(text) = body.as_mut() {
            text.push_str(line);
        }
    }
    blocks
}

/// DER from PEM text, or `bytes` unchanged when they are not PEM.
#[must_use]
pub fn pem_or_der(bytes: &[u8]) -> Vec<u8> {
    std::str::from_utf8(bytes)
        .ok()
        .filter(|text| text.contains(BEGIN))
        .and_then(pem_to_der)
        .unwrap_or_else(|| bytes.to_vec())
}

fn prefixed(header: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.len() + key.len());
    out.extend_from_slice(header);
    out.extend_from_slice(key);
    out
}

/// SPKI DER for an uncompressed P-256 point (65 bytes).
///
/// `AlgorithmIdentifier` is id-ecPublicKey with the prime256v1 curve;
/// only the trailing BIT STRING varies.
#[must_use]
pub fn encode_p256_spki(pub_key: &[u8]) -> Vec<u8> {
    #[rustfmt::skip]
    const HEADER: [u8; 26] = [
        0x30, 0x59,
        0x30, 0x13,
        0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01,
        0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07,
        0x03, 0x42, 0x00,
    ];
    prefixed(&HEADER, pub_key)
}

/// SPKI DER for a raw Ed25519 key (32 bytes, OID 1.3.101.112).
#[must_use]
pub fn encode_ed25519_spki(pub_key: &[u8]) -> Vec<u8> {
    const HEADER: [u8; 12] = [0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00];
    prefixed(&HEADER, pub_key)
}
