use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use rosc::{OscMessage, OscPacket, OscType};

use super::{DriverError, SessionInfo, Transport, TransportCommand};
use crate::config::TransportConfig;
use crate::{LivectlError, Result};

const MAX_DATAGRAM: usize = 64 * 1024;

/// Transport driver for a DAW remote script that listens for OSC over UDP
/// and answers queries on a separate reply port.
#[derive(Debug)]
pub struct OscTransport {
    socket: UdpSocket,
    remote: SocketAddr,
    reply_timeout: Duration,
}

impl OscTransport {
    /// Binds the reply port and resolves the remote listener. No traffic is
    /// sent until the first command.
    pub fn connect(config: &TransportConfig) -> Result<Self> {
        let remote = (config.host.as_str(), config.send_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                LivectlError::config(format!("cannot resolve OSC host `{}`", config.host))
            })?;
        let socket = UdpSocket::bind(("0.0.0.0", config.reply_port))?;
        tracing::info!(%remote, reply_port = config.reply_port, "osc transport bound");
        Ok(Self {
            socket,
            remote,
            reply_timeout: config.reply_timeout(),
        })
    }

    /// Round-trips `/live/test` to confirm the remote script is listening.
    pub fn ping(&mut self) -> std::result::Result<(), DriverError> {
        self.query("/live/test").map(|_| ())
    }

    fn send_message(
        &self,
        addr: &str,
        args: Vec<OscType>,
    ) -> std::result::Result<(), DriverError> {
        let packet = OscPacket::Message(OscMessage {
            addr: addr.to_string(),
            args,
        });
        let bytes = rosc::encoder::encode(&packet).map_err(|e| DriverError::Osc(format!("{e:?}")))?;
        self.socket.send_to(&bytes, self.remote)?;
        tracing::trace!(addr, "osc message sent");
        Ok(())
    }

    fn query(&mut self, addr: &str) -> std::result::Result<Vec<OscType>, DriverError> {
        self.send_message(addr, Vec::new())?;

        let deadline = Instant::now() + self.reply_timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DriverError::NoReply {
                    address: addr.to_string(),
                });
            }
            self.socket.set_read_timeout(Some(remaining))?;
            let len = match self.socket.recv(&mut buf) {
                Ok(len) => len,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(DriverError::NoReply {
                        address: addr.to_string(),
                    })
                }
                Err(err) => return Err(err.into()),
            };
            let Ok((_, packet)) = rosc::decoder::decode_udp(&buf[..len]) else {
                tracing::debug!(len, "ignoring undecodable datagram");
                continue;
            };
            if let Some(message) = find_message(packet, addr) {
                return Ok(message.args);
            }
        }
    }

    fn query_f64(&mut self, addr: &str) -> std::result::Result<f64, DriverError> {
        let args = self.query(addr)?;
        args.first()
            .and_then(osc_number)
            .ok_or_else(|| DriverError::UnexpectedReply {
                address: addr.to_string(),
            })
    }
}

impl Transport for OscTransport {
    fn send(&mut self, command: TransportCommand) -> std::result::Result<(), DriverError> {
        tracing::debug!(%command, "transport");
        match command {
            TransportCommand::SetTempo(bpm) => {
                self.send_message("/live/song/set/tempo", vec![OscType::Float(bpm as f32)])
            }
            TransportCommand::SetTimeSignature {
                numerator,
                denominator,
            } => {
                self.send_message(
                    "/live/song/set/signature_numerator",
                    vec![OscType::Int(osc_int(numerator as usize))],
                )?;
                self.send_message(
                    "/live/song/set/signature_denominator",
                    vec![OscType::Int(osc_int(denominator as usize))],
                )
            }
            TransportCommand::SetPosition(beat) => self.send_message(
                "/live/song/set/current_song_time",
                vec![OscType::Float(beat as f32)],
            ),
            TransportCommand::StartPlayback => {
                self.send_message("/live/song/start_playing", Vec::new())
            }
            TransportCommand::StopPlayback => {
                self.send_message("/live/song/stop_playing", Vec::new())
            }
            TransportCommand::SetRecordMode(on) => self.send_message(
                "/live/song/set/record_mode",
                vec![OscType::Int(i32::from(on))],
            ),
            TransportCommand::FireScene(index) => {
                self.send_message("/live/scene/fire", vec![OscType::Int(osc_int(index))])
            }
        }
    }
}

impl SessionInfo for OscTransport {
    fn song_length_beats(&mut self) -> std::result::Result<f64, DriverError> {
        self.query_f64("/live/song/get/song_length")
    }

    fn tempo(&mut self) -> std::result::Result<f64, DriverError> {
        self.query_f64("/live/song/get/tempo")
    }
}

fn osc_int(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn osc_number(arg: &OscType) -> Option<f64> {
    match arg {
        OscType::Float(v) => Some(f64::from(*v)),
        OscType::Double(v) => Some(*v),
        OscType::Int(v) => Some(f64::from(*v)),
        OscType::Long(v) => Some(*v as f64),
        _ => None,
    }
}

fn find_message(packet: OscPacket, addr: &str) -> Option<OscMessage> {
    match packet {
        OscPacket::Message(msg) if msg.addr == addr => Some(msg),
        OscPacket::Message(_) => None,
        OscPacket::Bundle(bundle) => bundle
            .content
            .into_iter()
            .find_map(|inner| find_message(inner, addr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_pair() -> (OscTransport, UdpSocket) {
        let remote = UdpSocket::bind("127.0.0.1:0").unwrap();
        let config = TransportConfig {
            host: "127.0.0.1".to_string(),
            send_port: remote.local_addr().unwrap().port(),
            reply_port: 0,
            reply_timeout_ms: 500,
        };
        (OscTransport::connect(&config).unwrap(), remote)
    }

    fn receive(socket: &UdpSocket) -> (OscMessage, SocketAddr) {
        let mut buf = [0u8; 1024];
        let (len, from) = socket.recv_from(&mut buf).unwrap();
        match rosc::decoder::decode_udp(&buf[..len]).unwrap().1 {
            OscPacket::Message(msg) => (msg, from),
            OscPacket::Bundle(_) => panic!("expected a message"),
        }
    }

    #[test]
    fn fire_scene_sends_index() {
        let (mut driver, remote) = local_pair();
        driver.fire_scene(3).unwrap();

        let (msg, _) = receive(&remote);
        assert_eq!(msg.addr, "/live/scene/fire");
        assert_eq!(msg.args, vec![OscType::Int(3)]);
    }

    #[test]
    fn time_signature_sends_both_halves() {
        let (mut driver, remote) = local_pair();
        driver.set_time_signature(6, 8).unwrap();

        assert_eq!(receive(&remote).0.addr, "/live/song/set/signature_numerator");
        assert_eq!(receive(&remote).0.addr, "/live/song/set/signature_denominator");
    }

    #[test]
    fn tempo_query_reads_reply() {
        let (mut driver, remote) = local_pair();
        let responder = std::thread::spawn(move || {
            let (msg, from) = receive(&remote);
            let reply = OscPacket::Message(OscMessage {
                addr: msg.addr,
                args: vec![OscType::Float(128.0)],
            });
            remote
                .send_to(&rosc::encoder::encode(&reply).unwrap(), from)
                .unwrap();
        });

        assert_eq!(driver.tempo().unwrap(), 128.0);
        responder.join().unwrap();
    }

    #[test]
    fn silent_remote_is_no_reply() {
        let (mut driver, _remote) = local_pair();
        let err = driver.song_length_beats().unwrap_err();
        assert!(matches!(err, DriverError::NoReply { .. }));
    }
}
