//! VBAN-TEXT remote control over UDP.
//!
//! Every datagram starts with a 28-byte VBAN header:
//!
//! ```text
//! 0..4    "VBAN"
//! 4       sub-protocol (high 3 bits) | rate index (low 5 bits)
//! 5..8    protocol-specific bytes
//! 8..24   stream name, NUL padded
//! 24..28  frame counter, little endian
//! ```
//!
//! Commands go out as TEXT packets (`0x40`, UTF-8) on the mixer's command
//! stream.  Liveness is checked with a SERVICE ping (`0x60`) that the mixer
//! answers with a reply flag set.  UDP offers no per-command acknowledgement,
//! so a send error (for example an ICMP port-unreachable surfacing on a
//! connected socket) is the only mid-session failure signal.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use super::{MixerBackend, MixerError};

pub const HEADER_LEN: usize = 28;
const STREAM_NAME_LEN: usize = 16;

pub const PROTOCOL_TEXT: u8 = 0x40;
pub const PROTOCOL_SERVICE: u8 = 0x60;
const PROTOCOL_MASK: u8 = 0xE0;
/// Text payload encoding: UTF-8.
const TEXT_UTF8: u8 = 0x10;
const SERVICE_IDENTIFICATION: u8 = 0x00;
const SERVICE_REPLY: u8 = 0x80;
const PING_STREAM: &str = "VBAN Service";
/// Size of the identification block carried by ping requests.
const PING_PAYLOAD_LEN: usize = 676;
/// Largest text command the mixer accepts in one packet.
const MAX_TEXT_LEN: usize = 1436 - HEADER_LEN;

/// Build a VBAN header.
pub fn header(
    protocol_byte: u8,
    b5: u8,
    b6: u8,
    b7: u8,
    stream: &str,
    frame: u32,
) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[0..4].copy_from_slice(b"VBAN");
    h[4] = protocol_byte;
    h[5] = b5;
    h[6] = b6;
    h[7] = b7;
    let name = stream.as_bytes();
    let n = name.len().min(STREAM_NAME_LEN);
    h[8..8 + n].copy_from_slice(&name[..n]);
    h[24..28].copy_from_slice(&frame.to_le_bytes());
    h
}

fn ping_request(frame: u32) -> Vec<u8> {
    let mut packet = header(
        PROTOCOL_SERVICE,
        0,
        SERVICE_IDENTIFICATION,
        0,
        PING_STREAM,
        frame,
    )
    .to_vec();
    packet.resize(HEADER_LEN + PING_PAYLOAD_LEN, 0);
    packet
}

fn is_ping_reply(packet: &[u8]) -> bool {
    packet.len() >= HEADER_LEN
        && &packet[0..4] == b"VBAN"
        && packet[4] & PROTOCOL_MASK == PROTOCOL_SERVICE
        && packet[5] == SERVICE_REPLY
        && packet[6] == SERVICE_IDENTIFICATION
}

fn text_packet(stream: &str, frame: u32, text: &str) -> Vec<u8> {
    let mut packet = header(PROTOCOL_TEXT, 0, 0, TEXT_UTF8, stream, frame).to_vec();
    packet.extend_from_slice(text.as_bytes());
    packet
}

/// Format a parameter assignment the way the mixer's script parser expects.
pub fn command(param: &str, value: f32) -> String {
    format!("{param}={value};")
}

// ---------------------------------------------------------------------------
// VbanTextBackend
// ---------------------------------------------------------------------------

pub struct VbanTextBackend {
    host: String,
    port: u16,
    stream_name: String,
    ping_timeout: Duration,
    socket: Option<UdpSocket>,
    frame: u32,
}

impl VbanTextBackend {
    pub fn new(host: impl Into<String>, port: u16, stream_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            stream_name: stream_name.into(),
            ping_timeout: Duration::from_millis(250),
            socket: None,
            frame: 0,
        }
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    fn next_frame(&mut self) -> u32 {
        let f = self.frame;
        self.frame = self.frame.wrapping_add(1);
        f
    }

    async fn resolve(&self) -> Result<SocketAddr, MixerError> {
        let target = format!("{}:{}", self.host, self.port);
        let first = tokio::net::lookup_host(target.as_str())
            .await
            .map_err(|_| MixerError::Address(target.clone()))?
            .next();
        first.ok_or(MixerError::Address(target))
    }

    async fn ping(&mut self, socket: &UdpSocket, addr: SocketAddr) -> Result<(), MixerError> {
        let request = ping_request(self.next_frame());
        socket.send(&request).await?;

        let deadline = tokio::time::Instant::now() + self.ping_timeout;
        let mut buf = [0u8; 2048];
        loop {
            let no_response = || MixerError::NoResponse {
                addr: addr.to_string(),
                timeout_ms: self.ping_timeout.as_millis() as u64,
            };
            match tokio::time::timeout_at(deadline, socket.recv(&mut buf)).await {
                Err(_) => return Err(no_response()),
                // Port-unreachable on a connected socket means nobody listens.
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    return Err(no_response())
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(n)) if is_ping_reply(&buf[..n]) => return Ok(()),
                Ok(Ok(_)) => continue,
            }
        }
    }
}

#[async_trait]
impl MixerBackend for VbanTextBackend {
    async fn login(&mut self) -> Result<(), MixerError> {
        self.socket = None;
        let addr = self.resolve().await?;
        let bind: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(addr).await?;
        self.ping(&socket, addr).await?;

        log::debug!(
            "mixer: vban peer={addr} stream={:?} answered ping",
            self.stream_name
        );
        self.socket = Some(socket);
        Ok(())
    }

    async fn set_parameter(&mut self, param: &str, value: f32) -> Result<(), MixerError> {
        let text = command(param, value);
        debug_assert!(text.len() <= MAX_TEXT_LEN);
        let frame = self.next_frame();
        let socket = self.socket.as_ref().ok_or(MixerError::NotConnected)?;
        let packet = text_packet(&self.stream_name, frame, &text);
        let sent = socket.send(&packet).await;
        if let Err(e) = sent {
            self.socket = None;
            return Err(e.into());
        }
        log::trace!("mixer: sent {text}");
        Ok(())
    }

    async fn check_alive(&mut self) -> Result<(), MixerError> {
        let socket = self.socket.take().ok_or(MixerError::NotConnected)?;
        let addr = socket.peer_addr()?;
        self.ping(&socket, addr).await?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn logout(&mut self) {
        self.socket = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fake mixer: answers pings, forwards received command text.
    async fn fake_mixer(reply: bool) -> (SocketAddr, tokio::sync::mpsc::Receiver<String>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let packet = &buf[..n];
                match packet[4] & PROTOCOL_MASK {
                    PROTOCOL_SERVICE if reply => {
                        let mut answer = packet.to_vec();
                        answer[5] = SERVICE_REPLY;
                        let _ = socket.send_to(&answer, peer).await;
                    }
                    PROTOCOL_TEXT => {
                        let text = String::from_utf8_lossy(&packet[HEADER_LEN..]).into_owned();
                        let _ = tx.send(text).await;
                    }
                    _ => {}
                }
            }
        });
        (addr, rx)
    }

    #[test]
    fn header_layout() {
        let h = header(PROTOCOL_TEXT, 0, 0, TEXT_UTF8, "Command1", 7);
        assert_eq!(&h[0..4], b"VBAN");
        assert_eq!(h[4], 0x40);
        assert_eq!(h[7], 0x10);
        assert_eq!(&h[8..16], b"Command1");
        assert!(h[16..24].iter().all(|&b| b == 0));
        assert_eq!(&h[24..28], &[7, 0, 0, 0]);
    }

    #[test]
    fn long_stream_names_are_truncated() {
        let h = header(PROTOCOL_TEXT, 0, 0, 0, "abcdefghijklmnopqrstuvwxyz", 0);
        assert_eq!(&h[8..24], b"abcdefghijklmnop");
    }

    #[test]
    fn command_formatting() {
        assert_eq!(command("Strip[0].Mute", 1.0), "Strip[0].Mute=1;");
        assert_eq!(command("Strip[1].B1", 0.0), "Strip[1].B1=0;");
        assert_eq!(command("Strip[2].Gain", -6.5), "Strip[2].Gain=-6.5;");
    }

    #[test]
    fn ping_packets() {
        let req = ping_request(3);
        assert_eq!(req.len(), HEADER_LEN + PING_PAYLOAD_LEN);
        assert!(!is_ping_reply(&req));

        let mut reply = req.clone();
        reply[5] = SERVICE_REPLY;
        assert!(is_ping_reply(&reply));
        assert!(!is_ping_reply(&reply[..10]));
    }

    #[tokio::test]
    async fn login_then_send_command() {
        let (addr, mut rx) = fake_mixer(true).await;
        let mut backend = VbanTextBackend::new("127.0.0.1", addr.port(), "Command1")
            .with_ping_timeout(Duration::from_millis(500));

        backend.login().await.unwrap();
        backend.set_parameter("Strip[0].Mute", 1.0).await.unwrap();

        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(text, "Strip[0].Mute=1;");
    }

    #[tokio::test]
    async fn liveness_check_passes_while_mixer_answers() {
        let (addr, _rx) = fake_mixer(true).await;
        let mut backend = VbanTextBackend::new("127.0.0.1", addr.port(), "Command1")
            .with_ping_timeout(Duration::from_millis(500));

        backend.login().await.unwrap();
        backend.check_alive().await.unwrap();
        assert!(backend.socket.is_some());
    }

    #[tokio::test]
    async fn liveness_check_detects_mixer_that_stopped_answering() {
        let mixer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = mixer.local_addr().unwrap().port();
        let mut backend = VbanTextBackend::new("127.0.0.1", port, "Command1")
            .with_ping_timeout(Duration::from_millis(100));

        // Answer the login ping only.
        let answer_once = async {
            let mut buf = [0u8; 2048];
            let (n, peer) = mixer.recv_from(&mut buf).await.unwrap();
            let mut reply = buf[..n].to_vec();
            reply[5] = SERVICE_REPLY;
            mixer.send_to(&reply, peer).await.unwrap();
        };
        let (login, ()) = tokio::join!(backend.login(), answer_once);
        login.unwrap();

        // Commands go out unacknowledged and still report success.
        backend.set_parameter("Strip[0].Mute", 1.0).await.unwrap();

        let err = backend.check_alive().await.unwrap_err();
        assert!(matches!(err, MixerError::NoResponse { .. }));
        assert!(backend.socket.is_none());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let (addr, _rx) = fake_mixer(false).await;
        let mut backend = VbanTextBackend::new("127.0.0.1", addr.port(), "Command1")
            .with_ping_timeout(Duration::from_millis(50));

        let err = backend.login().await.unwrap_err();
        assert!(matches!(err, MixerError::NoResponse { .. }));
    }

    #[tokio::test]
    async fn commands_require_login() {
        let mut backend = VbanTextBackend::new("127.0.0.1", 6980, "Command1");
        let err = backend.set_parameter("Strip[0].Mute", 1.0).await.unwrap_err();
        assert!(matches!(err, MixerError::NotConnected));
        let err = backend.check_alive().await.unwrap_err();
        assert!(matches!(err, MixerError::NotConnected));

        backend.logout().await;
        assert!(backend.socket.is_none());
    }

    #[tokio::test]
    async fn unresolvable_host() {
        let mut backend = VbanTextBackend::new("no such host", 6980, "Command1");
        assert!(matches!(
            backend.login().await.unwrap_err(),
            MixerError::Address(_)
        ));
    }
}
