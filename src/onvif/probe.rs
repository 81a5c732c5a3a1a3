use anyhow::Result;
use local_ip_address::list_afinet_netifas;
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::warn;
use uuid::Uuid;

const WS_DISCOVERY_MULTICAST: &str = "239.255.255.250:3702";
const PROBE_MESSAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<e:Envelope xmlns:e="http://www.w3.org/2003/05/soap-envelope"
            xmlns:w="http://schemas.xmlsoap.org/ws/2004/08/addressing"
            xmlns:d="http://schemas.xmlsoap.org/ws/2005/04/discovery"
            xmlns:dn="http://www.onvif.org/ver10/network/wsdl">
  <e:Header>
    <w:MessageID>uuid:2bf8e1cd-8f37-4b86-9e75-2f3e5f0a1b9c</w:MessageID>
    <w:To>urn:schemas-xmlsoap-org:ws:2005:04:discovery</w:To>
    <w:Action>http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe</w:Action>
  </e:Header>
  <e:Body>
    <d:Probe>
      <d:Types>dn:NetworkVideoTransmitter</d:Types>
    </d:Probe>
  </e:Body>
</e:Envelope>"#;

static UUID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"urn:uuid:([0-9a-fA-F-]{36})").expect("valid uuid regex"));
static ADDR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d+(\.\d+)+:\d+").expect("valid addr regex"));

/// A single WS-Discovery probe reply, reduced to the two fields the Discovery
/// Loop cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMatch {
    pub uuid: Uuid,
    pub addr: String,
}

/// Extracts `(uuid, host:port)` from a raw probe reply using the two literal
/// regexes the spec pins. Replies missing either field are skipped with a
/// warning, never treated as a fatal parse error.
pub fn extract_match(reply: &str) -> Option<DiscoveryMatch> {
    let uuid_str = UUID_RE.captures(reply)?.get(1)?.as_str();
    let addr = ADDR_RE.find(reply)?.as_str().to_string();

    match Uuid::parse_str(uuid_str) {
        Ok(uuid) => Some(DiscoveryMatch { uuid, addr }),
        Err(e) => {
            warn!("discovery reply had unparsable uuid {uuid_str}: {e}");
            None
        }
    }
}

/// Probes every non-loopback local IPv4 interface in parallel and returns the
/// accumulated, deduplicated match list. A single interface's probe failing
/// is logged and skipped; it never fails the whole cycle.
pub async fn probe_all_interfaces(timeout: Duration) -> Result<Vec<DiscoveryMatch>> {
    let interfaces = list_afinet_netifas().unwrap_or_default();
    let local_ips: Vec<Ipv4Addr> = interfaces
        .into_iter()
        .filter_map(|(_, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        })
        .collect();

    let matches = std::sync::Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();

    for ip in local_ips {
        let matches = matches.clone();
        handles.push(tokio::spawn(async move {
            match probe_interface(ip, timeout).await {
                Ok(found) => {
                    let mut guard = matches.lock().expect("probe mutex poisoned");
                    guard.extend(found);
                }
                Err(e) => warn!("discovery probe on interface {ip} failed: {e}"),
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    let mut result = matches.lock().expect("probe mutex poisoned").clone();
    result.dedup_by(|a, b| a.uuid == b.uuid);
    Ok(result)
}

async fn probe_interface(local_ip: Ipv4Addr, timeout: Duration) -> Result<Vec<DiscoveryMatch>> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(local_ip), 0)).await?;
    socket.set_broadcast(true)?;
    socket
        .send_to(PROBE_MESSAGE.as_bytes(), WS_DISCOVERY_MULTICAST)
        .await?;

    let mut found = Vec::new();
    let mut buf = [0u8; 65507];
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                let reply = String::from_utf8_lossy(&buf[..len]);
                if let Some(m) = extract_match(&reply) {
                    found.push(m);
                }
            }
            Ok(Err(e)) => {
                warn!("discovery recv error on {local_ip}: {e}");
                break;
            }
            Err(_) => break,
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_uuid_and_addr_from_a_realistic_reply() {
        let reply = r#"<a:RelatesTo xmlns:a="x">urn:uuid:12345678-90ab-cdef-1234-567890abcdef</a:RelatesTo>
            <d:XAddrs>http://10.0.0.5:8899/onvif/device_service</d:XAddrs>"#;
        let m = extract_match(reply).expect("should match");
        assert_eq!(m.uuid.to_string(), "12345678-90ab-cdef-1234-567890abcdef");
        assert_eq!(m.addr, "10.0.0.5:8899");
    }

    #[test]
    fn missing_uuid_yields_none() {
        let reply = r#"<d:XAddrs>http://10.0.0.5:8899/onvif/device_service</d:XAddrs>"#;
        assert!(extract_match(reply).is_none());
    }

    #[test]
    fn missing_addr_yields_none() {
        let reply = r#"urn:uuid:12345678-90ab-cdef-1234-567890abcdef"#;
        assert!(extract_match(reply).is_none());
    }

    #[test]
    fn malformed_uuid_is_skipped_not_panicked() {
        let reply = r#"urn:uuid:zzzzzzzz-90ab-cdef-1234-567890abcdef 10.0.0.5:8899"#;
        assert!(extract_match(reply).is_none());
    }
}
