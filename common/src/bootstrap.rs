//! Out-of-band material that lets a client pin the server certificate.

use serde::{Deserialize, Serialize};

use crate::identity::PinningHash;

/// Hash algorithm name as understood by `WebTransport` clients.
pub const HASH_ALGORITHM: &str = "sha-256";

/// One entry of `serverCertificateHashes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateHash {
    /// Always [`HASH_ALGORITHM`].
    pub algorithm: String,
    /// Base64 digest.
    pub value:     String,
}

/// Everything a client needs to open a pinned session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
    /// Session URL, e.g. `https://127.0.0.1:12345/say-hello`.
    pub address:                   String,
    /// Accepted certificate hashes.
    pub server_certificate_hashes: Vec<CertificateHash>,
}

impl ConnectionDetails {
    /// Details for a single pinned certificate.
    pub fn new(address: impl Into<String>, hash: &PinningHash) -> Self {
        Self {
            address:                   address.into(),
            server_certificate_hashes: vec![CertificateHash {
                algorithm: HASH_ALGORITHM.to_string(),
                value:     hash.to_base64(),
            }],
        }
    }

    /// JSON form, one line.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Renders a script that can be pasted into a browser console.
///
/// It opens a session with the pinned hashes, creates one bidirectional
/// stream, writes a hello on it and reports how many bytes the server sent
/// back. In echo mode the server answers the hello; in bulk mode it ignores
/// it and streams the transfer.
pub fn render_browser_script(details: &ConnectionDetails) -> String {
    let hashes = details
        .server_certificate_hashes
        .iter()
        .map(|h| {
            format!(
                "{{\n      algorithm: '{}',\n      value: Uint8Array.from(atob('{}'), (m) => m.codePointAt(0))\n    }}",
                h.algorithm, h.value
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"(async function main () {{
  console.info('CLIENT create session')
  const transport = new WebTransport('{address}', {{
    serverCertificateHashes: [{hashes}]
  }})

  console.info('CLIENT wait for session')
  await transport.ready
  console.info('CLIENT session ready')

  console.info('CLIENT create bidi stream')
  const stream = await transport.createBidirectionalStream()
  const reader = stream.readable.getReader()

  const writer = stream.writable.getWriter()
  await writer.write(new TextEncoder().encode('hello'))
  await writer.close()

  let bytes = 0

  try {{
    while (true) {{
      const res = await reader.read()

      if (res.done) {{
        console.info('CLIENT read stream finished')
        break
      }}

      bytes += res.value.byteLength
    }}

    console.info('CLIENT received', bytes, 'bytes')
  }} catch (err) {{
    console.info('CLIENT read errored', err)
  }}
}})()
"#,
        address = details.address,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::compute_pinning_hash;

    #[test]
    fn details_serialize_like_the_webtransport_options() {
        let hash = compute_pinning_hash(b"cert");
        let details = ConnectionDetails::new("https://127.0.0.1:12345/say-hello", &hash);

        let json: serde_json::Value = serde_json::from_str(&details.to_json().unwrap()).unwrap();
        assert_eq!(json["address"], "https://127.0.0.1:12345/say-hello");
        assert_eq!(json["serverCertificateHashes"][0]["algorithm"], "sha-256");
        assert_eq!(
            json["serverCertificateHashes"][0]["value"],
            hash.to_base64().as_str()
        );
    }

    #[test]
    fn script_embeds_address_and_hash() {
        let hash = compute_pinning_hash(b"cert");
        let details = ConnectionDetails::new("https://127.0.0.1:12345/say-hello", &hash);
        let script = render_browser_script(&details);

        assert!(script.contains("new WebTransport('https://127.0.0.1:12345/say-hello'"));
        assert!(script.contains(&format!("atob('{}')", hash.to_base64())));
        assert!(script.contains("algorithm: 'sha-256'"));
    }

    #[test]
    fn script_sends_a_hello_before_reading() {
        let hash = compute_pinning_hash(b"cert");
        let details = ConnectionDetails::new("https://[::1]:4433/say-hello", &hash);
        let script = render_browser_script(&details);

        let write = script.find("writer.write(").unwrap();
        let close = script.find("writer.close()").unwrap();
        let read = script.find("reader.read()").unwrap();
        assert!(write < close && close < read);
    }
}
