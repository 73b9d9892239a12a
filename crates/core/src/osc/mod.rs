//! OSC input over UDP.
//!
//! Message arguments are read as key/value pairs: `["s", "bd", "n", 3]`
//! becomes the event `s/bd/n/3`. The address pattern is ignored and bundles
//! are flattened in order.

use std::net::SocketAddr;

use rosc::{OscMessage, OscPacket, OscType};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::{debug, warn};

use crate::protocol::{Event, Value};
use crate::Result;

/// Port SuperCollider-style clients send to by default.
pub const DEFAULT_OSC_PORT: u16 = 57120;

const BUFFER_SIZE: usize = 4096;

/// Converts one message into an event.
///
/// A key that is not a string is skipped on its own, so the next argument is
/// tried as a key. Pairs whose value has no textual form are dropped.
pub fn message_to_event(message: &OscMessage) -> Event {
    let mut event = Event::new();
    let args = &message.args;
    let mut i = 0;
    while i + 1 < args.len() {
        let OscType::String(key) = &args[i] else {
            i += 1;
            continue;
        };
        match arg_text(&args[i + 1]) {
            Some(value) => event.insert(key.as_str(), Value::Text(value)),
            None => debug!(key = %key, "dropping osc argument without a text form"),
        }
        i += 2;
    }
    event
}

fn arg_text(arg: &OscType) -> Option<String> {
    Some(match arg {
        OscType::Int(v) => v.to_string(),
        OscType::Float(v) => v.to_string(),
        OscType::Double(v) => v.to_string(),
        OscType::Long(v) => v.to_string(),
        OscType::String(s) => s.clone(),
        OscType::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        _ => return None,
    })
}

/// Appends the non-empty events carried by `packet`, bundles flattened.
pub fn packet_events(packet: &OscPacket, events: &mut Vec<Event>) {
    match packet {
        OscPacket::Message(message) => {
            let event = message_to_event(message);
            if !event.is_empty() {
                events.push(event);
            }
        }
        OscPacket::Bundle(bundle) => {
            for packet in &bundle.content {
                packet_events(packet, events);
            }
        }
    }
}

/// UDP socket that yields events from incoming OSC packets.
pub struct OscListener {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl OscListener {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            buf: vec![0; BUFFER_SIZE],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Waits for the next datagram. Packets that fail to decode yield no
    /// events.
    pub async fn recv(&mut self) -> Result<Vec<Event>> {
        let (len, from) = self.socket.recv_from(&mut self.buf).await?;
        let mut events = Vec::new();
        match rosc::decoder::decode_udp(&self.buf[..len]) {
            Ok((_, packet)) => packet_events(&packet, &mut events),
            Err(e) => warn!(%from, error = ?e, "ignoring malformed osc packet"),
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use rosc::{OscBundle, OscTime};

    use super::*;
    use crate::protocol::encode_path;

    fn message(args: Vec<OscType>) -> OscMessage {
        OscMessage {
            addr: "/play".into(),
            args,
        }
    }

    #[test]
    fn arguments_pair_into_keys_and_values() {
        let event = message_to_event(&message(vec![
            OscType::String("s".into()),
            OscType::String("kick".into()),
            OscType::String("note".into()),
            OscType::Int(60),
            OscType::String("gain".into()),
            OscType::Float(0.8),
            OscType::String("legato".into()),
            OscType::Bool(true),
        ]));

        assert_eq!(encode_path(&event).as_str(), "s/kick/note/60/gain/0.8/legato/1");
        assert_eq!(event.get_number("note"), Some(60.0));
    }

    #[test]
    fn non_string_keys_are_skipped_one_at_a_time() {
        let event = message_to_event(&message(vec![
            OscType::Int(1),
            OscType::String("s".into()),
            OscType::String("bd".into()),
            OscType::String("orphan".into()),
        ]));

        assert_eq!(encode_path(&event).as_str(), "s/bd");
    }

    #[tokio::test]
    async fn bundles_arrive_as_separate_events() {
        let mut listener = OscListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();

        let bundle = OscPacket::Bundle(OscBundle {
            timetag: OscTime {
                seconds: 0,
                fractional: 1,
            },
            content: vec![
                OscPacket::Message(message(vec![
                    OscType::String("s".into()),
                    OscType::String("bd".into()),
                ])),
                OscPacket::Message(message(vec![])),
                OscPacket::Message(message(vec![
                    OscType::String("s".into()),
                    OscType::String("sine".into()),
                    OscType::String("freq".into()),
                    OscType::Double(220.5),
                ])),
            ],
        });
        let bytes = rosc::encoder::encode(&bundle).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&bytes, target).await.unwrap();

        let events = listener.recv().await.unwrap();
        let paths: Vec<String> = events
            .iter()
            .map(|event| encode_path(event).as_str().to_string())
            .collect();
        assert_eq!(paths, vec!["s/bd", "s/sine/freq/220.5"]);

        sender.send_to(b"not osc", target).await.unwrap();
        assert!(listener.recv().await.unwrap().is_empty());
    }
}
