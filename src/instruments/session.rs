//! The instruments RPC session: fragment reassembly, reply correlation and
//! channel dispatch on top of the wire format in [`super::message`].
//!
//! One background receiver task owns the read half of the transport; callers
//! share the write half behind a mutex so that one message's fragments are
//! never interleaved with another's on the wire, while replies for
//! concurrently outstanding calls may still interleave at the fragment level
//! (reassembly is keyed by `(channel, identifier)`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

use super::message::{Aux, AuxValue, Message, MessageHeader, PayloadHeader};
use crate::error::{Error, Result};
use crate::ReadWrite;

/// Invoked once per unsolicited (no matching pending reply) message on a
/// registered channel. Runs inline on the receiver task: a slow callback
/// delays dispatch of later messages, per the session's single-receiver model.
pub type ChannelCallback = Box<dyn Fn(Message) + Send + Sync>;

#[derive(Default)]
struct ChannelTable {
    by_name: HashMap<String, u32>,
    callbacks: HashMap<u32, ChannelCallback>,
}

struct Shared {
    pending: Mutex<HashMap<u32, oneshot::Sender<Message>>>,
    channels: Mutex<ChannelTable>,
    next_reply_id: AtomicU32,
    next_channel_code: AtomicU32,
}

/// A live instruments RPC session over a lockdown-started service socket.
pub struct RpcSession {
    writer: Mutex<WriteHalf<Box<dyn ReadWrite>>>,
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession").finish_non_exhaustive()
    }
}

impl RpcSession {
    /// Takes ownership of `socket` and spawns the background receiver.
    pub fn start(socket: Box<dyn ReadWrite>) -> Self {
        let (read_half, write_half) = split(socket);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            channels: Mutex::new(ChannelTable::default()),
            next_reply_id: AtomicU32::new(1),
            next_channel_code: AtomicU32::new(1),
        });
        let stop = Arc::new(AtomicBool::new(false));
        let receiver = tokio::spawn(Self::receive_loop(read_half, shared.clone(), stop.clone()));

        Self {
            writer: Mutex::new(write_half),
            shared,
            stop,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    async fn receive_loop(
        mut reader: ReadHalf<Box<dyn ReadWrite>>,
        shared: Arc<Shared>,
        stop: Arc<AtomicBool>,
    ) {
        let mut partial: HashMap<(u32, u32), (MessageHeader, Vec<u8>)> = HashMap::new();

        loop {
            if stop.load(Ordering::Acquire) {
                break;
            }
            let (header, body) = match Message::read_fragment(&mut reader).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("instruments receiver stopping: {e}");
                    break;
                }
            };

            let key = (header.channel, header.identifier());
            let last_fragment = header.fragment_id() + 1 == header.fragment_count();
            let entry = partial.entry(key).or_insert_with(|| (header.clone(), Vec::new()));
            entry.1.extend(body);
            if !last_fragment {
                continue;
            }
            let (header, data) = partial.remove(&key).expect("just inserted above");

            let message = match Message::finish(header, data) {
                Ok(m) => m,
                Err(e) => {
                    warn!("dropping unparseable instruments message: {e}");
                    continue;
                }
            };

            let reply_id = message.message_header.identifier();
            let waiter = shared.pending.lock().await.remove(&reply_id);
            if let Some(tx) = waiter {
                let _ = tx.send(message);
                continue;
            }

            let channel = message.message_header.channel;
            let channels = shared.channels.lock().await;
            match channels.callbacks.get(&channel) {
                Some(cb) => cb(message),
                None => warn!("received message for unregistered channel {channel}, dropping"),
            }
        }

        // Session closed: dropping every pending sender fails its receiver
        // end with a RecvError, which `call` turns into `SessionClosed`.
        shared.pending.lock().await.clear();
    }

    /// Ensures a channel named `name` is registered, returning its code.
    /// Idempotent: a second call for the same name issues no control message.
    pub async fn make_channel(&self, name: &str) -> Result<u32> {
        if let Some(&code) = self.shared.channels.lock().await.by_name.get(name) {
            return Ok(code);
        }

        let code = self.shared.next_channel_code.fetch_add(1, Ordering::SeqCst);
        let args = vec![
            AuxValue::U32(code),
            AuxValue::archived_value(plist::Value::String(name.to_string())),
        ];
        let selector = plist::Value::String("_requestChannelWithCode:identifier:".to_string());
        let reply = self.invoke(0, Some(selector), args, true).await?;
        if reply.data.is_some() {
            return Err(Error::UnexpectedResponse);
        }

        self.shared.channels.lock().await.by_name.insert(name.to_string(), code);
        Ok(code)
    }

    /// Registers (or replaces) the callback invoked for unsolicited messages
    /// on `name`, creating the channel first if needed.
    pub async fn register_channel_callback<F>(&self, name: &str, callback: F) -> Result<()>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let code = self.make_channel(name).await?;
        self.shared
            .channels
            .lock()
            .await
            .callbacks
            .insert(code, Box::new(callback));
        Ok(())
    }

    /// Invokes `selector` on `channel_name` with `args`, blocking until the
    /// receiver resolves the reply.
    pub async fn call(&self, channel_name: &str, selector: &str, args: Vec<AuxValue>) -> Result<Message> {
        let channel = self.make_channel(channel_name).await?;
        let data = plist::Value::String(selector.to_string());
        self.invoke(channel, Some(data), args, true).await
    }

    async fn invoke(
        &self,
        channel: u32,
        data: Option<plist::Value>,
        args: Vec<AuxValue>,
        expect_reply: bool,
    ) -> Result<Message> {
        if self.stop.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }

        let reply_id = self.shared.next_reply_id.fetch_add(1, Ordering::SeqCst);
        let rx = if expect_reply {
            let (tx, rx) = oneshot::channel();
            self.shared.pending.lock().await.insert(reply_id, tx);
            Some(rx)
        } else {
            None
        };

        let header = MessageHeader::new(0, 1, reply_id, 0, channel, expect_reply);
        let payload_header = PayloadHeader::method_invocation();
        let aux = if args.is_empty() { None } else { Some(Aux::from_values(args)) };
        let message = Message::new(header, payload_header, aux, data);

        // Held across the whole write so one message's bytes are never
        // interrupted by a concurrent caller's fragments.
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(&message.serialize()).await?;
            writer.flush().await?;
        }

        match rx {
            Some(rx) => rx.await.map_err(|_| Error::SessionClosed),
            None => Ok(message),
        }
    }

    /// Signals the receiver to stop and joins it. Further `call`s fail with
    /// `SessionClosed`. The receiver only checks the stop flag between
    /// fragments, so this can block until the transport next yields a read
    /// (including an error from the peer closing). Safe to call more than
    /// once; later calls just see no handle left to join.
    pub async fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.receiver.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncWriteExt as _, DuplexStream};

    use super::*;

    /// A minimal fake instruments device: answers every `_requestChannelWithCode:identifier:`
    /// control call with an ack, and echoes every other call's first string aux value
    /// back as the reply's payload. Drops `server` after `expected_messages` requests
    /// so the client's receiver sees a clean EOF instead of blocking forever.
    async fn run_fake_device(mut server: DuplexStream, expected_messages: usize) {
        for _ in 0..expected_messages {
            let message = match Message::from_reader(&mut server).await {
                Ok(m) => m,
                Err(_) => return,
            };

            let reply_data = if message.message_header.channel == 0 {
                None
            } else {
                let echoed = message
                    .aux
                    .as_ref()
                    .and_then(|aux| aux.values.first())
                    .map(|v| format!("{v:?}"))
                    .unwrap_or_default();
                Some(plist::Value::String(echoed))
            };

            let reply_header = MessageHeader::new(
                0,
                1,
                message.message_header.identifier(),
                0,
                message.message_header.channel,
                false,
            );
            let reply = Message::new(reply_header, PayloadHeader::new(), None, reply_data);
            if server.write_all(&reply.serialize()).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn call_resolves_its_matching_reply() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(run_fake_device(server, 2));

        let session = RpcSession::start(Box::new(client));
        let reply = session
            .call("com.apple.instruments.server.services.sysmontap", "start", vec![])
            .await
            .expect("call succeeds");
        assert_eq!(reply.data, Some(plist::Value::String(String::new())));

        session.stop().await;
    }

    #[tokio::test]
    async fn concurrent_calls_each_get_their_own_reply() {
        let (client, server) = tokio::io::duplex(8192);
        tokio::spawn(run_fake_device(server, 4));

        let session = RpcSession::start(Box::new(client));
        let a = session.call("channel-a", "selector", vec![AuxValue::String("A".to_string())]);
        let b = session.call("channel-b", "selector", vec![AuxValue::String("B".to_string())]);
        let (a, b) = tokio::join!(a, b);

        assert_eq!(a.unwrap().data, Some(plist::Value::String("String(\"A\")".to_string())));
        assert_eq!(b.unwrap().data, Some(plist::Value::String("String(\"B\")".to_string())));

        session.stop().await;
    }

    #[tokio::test]
    async fn make_channel_is_idempotent() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(run_fake_device(server, 1));

        let session = RpcSession::start(Box::new(client));
        let first = session.make_channel("com.apple.instruments.server.services.sysmontap").await.unwrap();
        let second = session.make_channel("com.apple.instruments.server.services.sysmontap").await.unwrap();
        assert_eq!(first, second);

        session.stop().await;
    }

    #[tokio::test]
    async fn stop_fails_subsequent_calls_with_session_closed() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(run_fake_device(server, 2));

        let session = RpcSession::start(Box::new(client));
        session.call("channel", "selector", vec![]).await.expect("first call succeeds");
        session.stop().await;

        let err = session.call("channel", "selector", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
    }
}
