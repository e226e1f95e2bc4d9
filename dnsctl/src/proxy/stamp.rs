//! DNS stamp (sdns://) encoding for the forwarding proxy's server
//! descriptors. Only the DoH and DoT variants are needed; addresses are
//! left empty so the proxy resolves the hostname itself.

use crate::error::ProxyError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

const STAMP_PROTO_DOH: u8 = 0x02;
const STAMP_PROTO_DOT: u8 = 0x03;

// single-byte length prefix: anything longer cannot be encoded
const MAX_FIELD_LEN: usize = 0x7f;

fn push_lp(buf: &mut Vec<u8>, data: &[u8]) -> Result<(), ProxyError> {
    if data.len() > MAX_FIELD_LEN {
        return Err(ProxyError::StampField(
            String::from_utf8_lossy(data).into_owned(),
        ));
    }
    buf.push(data.len() as u8);
    buf.extend_from_slice(data);
    Ok(())
}

/// Encode a DoH server stamp from its URL. The path defaults to
/// `/dns-query` when the URL carries none.
pub fn doh_stamp(url: &url::Url) -> Result<String, ProxyError> {
    let mut hostname = url.host_str().unwrap_or_default().to_string();
    if let Some(port) = url.port() {
        hostname = format!("{}:{}", hostname, port);
    }
    let path = match url.path() {
        "" | "/" => "/dns-query",
        p => p,
    };
    let mut buf = vec![STAMP_PROTO_DOH];
    buf.extend_from_slice(&0u64.to_le_bytes());
    push_lp(&mut buf, b"")?; // server address: resolve via hostname
    push_lp(&mut buf, b"")?; // certificate hashes: none pinned
    push_lp(&mut buf, hostname.as_bytes())?;
    push_lp(&mut buf, path.as_bytes())?;
    Ok(format!("sdns://{}", URL_SAFE_NO_PAD.encode(buf)))
}

/// Encode a DoT server stamp from its bare hostname.
pub fn dot_stamp(host: &str) -> Result<String, ProxyError> {
    let mut buf = vec![STAMP_PROTO_DOT];
    buf.extend_from_slice(&0u64.to_le_bytes());
    push_lp(&mut buf, b"")?;
    push_lp(&mut buf, b"")?;
    push_lp(&mut buf, host.as_bytes())?;
    Ok(format!("sdns://{}", URL_SAFE_NO_PAD.encode(buf)))
}
