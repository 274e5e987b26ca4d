// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The encrypted connectionless UDP channel to game servers. One socket
//! serves both directions: outbound prompts/probes/signed requests, and a
//! single receive loop that wakes waiters correlated by `(source, uid)`.

pub mod crypto;
pub mod packet;

use master_protocol::id::ServerAuthToken;
use packet::Packet;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

/// Fixed uid used by the registration probe; game servers echo it back.
pub const PROBE_UID: u64 = 1_000_000_001;

/// What a waiter receives when a matching `I` packet arrives.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectReply {
    pub challenge: i32,
    pub data: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe target did not answer in time")]
    Timeout,
    #[error("probe send failed: {0}")]
    Io(#[from] io::Error),
}

type WaiterKey = (SocketAddr, u64);

struct Waiter {
    id: u64,
    tx: oneshot::Sender<ConnectReply>,
}

pub struct UdpControl {
    socket: UdpSocket,
    waiters: Mutex<HashMap<WaiterKey, Vec<Waiter>>>,
    next_waiter_id: AtomicU64,
    /// Datagrams that decrypted or decoded to nothing we handle.
    dropped: AtomicU64,
}

impl UdpControl {
    /// Binds the socket and spawns the receive loop.
    pub async fn spawn(bind_addr: SocketAddr) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        log::info!("udp control listening on {}", socket.local_addr()?);
        let control = Arc::new(Self {
            socket,
            waiters: Mutex::new(HashMap::new()),
            next_waiter_id: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        let recv = Arc::clone(&control);
        tokio::spawn(async move { recv.recv_loop().await });
        Ok(control)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn dropped_datagrams(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn recv_loop(&self) {
        // Comfortably above the game's MTU-sized datagrams.
        let mut buf = [0u8; 2048];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    log::warn!("udp recv error: {}", e);
                    continue;
                }
            };
            self.handle_datagram(src, &buf[..len]);
        }
    }

    fn handle_datagram(&self, src: SocketAddr, wire: &[u8]) {
        let plain = match crypto::open(wire) {
            Ok(plain) => plain,
            Err(e) => {
                log::debug!("discarding datagram from {}: {}", src, e);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        match packet::decode(&plain) {
            Ok(Packet::ConnectReply {
                challenge,
                uid,
                data,
            }) => {
                let woken = self.wake_waiters(src, uid, ConnectReply { challenge, data });
                if woken == 0 {
                    log::debug!("connect reply from {} for uid {} had no waiter", src, uid);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                } else {
                    log::trace!("woke {} waiter(s) for ({}, {})", woken, src, uid);
                }
            }
            Ok(other) => {
                log::debug!("discarding unhandled packet from {}: {:?}", src, other);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::debug!("discarding datagram from {}: {}", src, e);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Broadcasts the reply to every waiter registered for the key. Cheap
    /// and correct under duplicate replies.
    fn wake_waiters(&self, src: SocketAddr, uid: u64, reply: ConnectReply) -> usize {
        let waiters = self.waiters.lock().unwrap().remove(&(src, uid));
        match waiters {
            Some(list) => {
                let woken = list.len();
                for waiter in list {
                    // A waiter may have timed out between unregistering and
                    // now; that is fine.
                    let _ = waiter.tx.send(reply.clone());
                }
                woken
            }
            None => 0,
        }
    }

    /// Registers interest in `I` packets from `addr` carrying `uid`. The
    /// registration is dropped with the returned handle.
    pub fn register_waiter(&self, addr: SocketAddr, uid: u64) -> ReplyWaiter<'_> {
        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .unwrap()
            .entry((addr, uid))
            .or_default()
            .push(Waiter { id, tx });
        ReplyWaiter {
            control: self,
            key: (addr, uid),
            id,
            rx,
        }
    }

    /// Blocks until a matching reply arrives or `timeout` elapses. The
    /// waiter also unregisters when the caller's future is dropped.
    pub async fn wait_connect_reply(
        &self,
        addr: SocketAddr,
        uid: u64,
        timeout: Duration,
    ) -> Option<ConnectReply> {
        let mut waiter = self.register_waiter(addr, uid);
        tokio::time::timeout(timeout, waiter.wait()).await.ok().flatten()
    }

    pub async fn send_connect(&self, addr: SocketAddr, uid: u64) -> io::Result<()> {
        self.socket
            .send_to(&crypto::seal(&packet::encode_connect(uid)), addr)
            .await
            .map(|_| ())
    }

    /// Sends one signed request. Each call seals with a fresh nonce, so
    /// resending the same body produces distinct datagrams.
    pub async fn send_sigreq1(
        &self,
        addr: SocketAddr,
        token: &ServerAuthToken,
        body: &[u8],
    ) -> io::Result<()> {
        self.socket
            .send_to(&crypto::seal(&packet::encode_sigreq1(token, body)), addr)
            .await
            .map(|_| ())
    }

    /// The registration probe: challenge the game port and wait for the
    /// echo. Proves the address speaks the game's encrypted protocol.
    pub async fn probe(&self, addr: SocketAddr, timeout: Duration) -> Result<(), ProbeError> {
        let mut waiter = self.register_waiter(addr, PROBE_UID);
        self.socket
            .send_to(&crypto::seal(&packet::encode_getchallenge(PROBE_UID)), addr)
            .await?;
        match tokio::time::timeout(timeout, waiter.wait()).await {
            Ok(Some(_reply)) => Ok(()),
            _ => Err(ProbeError::Timeout),
        }
    }
}

pub struct ReplyWaiter<'a> {
    control: &'a UdpControl,
    key: WaiterKey,
    id: u64,
    rx: oneshot::Receiver<ConnectReply>,
}

impl ReplyWaiter<'_> {
    pub async fn wait(&mut self) -> Option<ConnectReply> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for ReplyWaiter<'_> {
    fn drop(&mut self) {
        let mut waiters = self.control.waiters.lock().unwrap();
        if let Some(list) = waiters.get_mut(&self.key) {
            list.retain(|waiter| waiter.id != self.id);
            if list.is_empty() {
                waiters.remove(&self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_local() -> Arc<UdpControl> {
        UdpControl::spawn("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    /// A stand-in game server: answers challenges and prompts with `I`
    /// packets after an optional delay.
    async fn spawn_reflector(delay: Duration) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (len, src) = socket.recv_from(&mut buf).await.unwrap();
                let plain = match crypto::open(&buf[..len]) {
                    Ok(plain) => plain,
                    Err(_) => continue,
                };
                let uid = match packet::decode(&plain) {
                    Ok(Packet::GetChallenge { uid }) | Ok(Packet::ConnectPrompt { uid }) => uid,
                    _ => continue,
                };
                tokio::time::sleep(delay).await;
                let reply = crypto::seal(&packet::encode_connect_reply(7, uid, b""));
                socket.send_to(&reply, src).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn probe_succeeds_against_reflector() {
        let control = spawn_local().await;
        let reflector = spawn_reflector(Duration::ZERO).await;
        control.probe(reflector, Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn probe_times_out_without_listener() {
        let control = spawn_local().await;
        // Nobody bound here; sends vanish.
        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        match control.probe(target, Duration::from_millis(200)).await {
            Err(ProbeError::Timeout) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
        // The waiter unregistered itself on the way out.
        assert!(control.waiters.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn all_waiters_for_a_key_are_woken() {
        let control = spawn_local().await;
        let reflector = spawn_reflector(Duration::from_millis(50)).await;

        let mut first = control.register_waiter(reflector, 42);
        let mut second = control.register_waiter(reflector, 42);
        control.send_connect(reflector, 42).await.unwrap();

        let (a, b) = tokio::join!(
            tokio::time::timeout(Duration::from_secs(2), first.wait()),
            tokio::time::timeout(Duration::from_secs(2), second.wait()),
        );
        assert!(a.unwrap().is_some());
        assert!(b.unwrap().is_some());
    }

    #[tokio::test]
    async fn replies_are_correlated_by_uid() {
        let control = spawn_local().await;
        let reflector = spawn_reflector(Duration::ZERO).await;

        // Waiting for uid 1 while only uid 2 is prompted: no wake.
        let miss = control.wait_connect_reply(reflector, 1, Duration::from_millis(200));
        control.send_connect(reflector, 2).await.unwrap();
        assert!(miss.await.is_none());

        // The uid-2 reply was dropped as unclaimed (its waiter was for uid 1).
        assert!(control.dropped_datagrams() >= 1);
    }

    #[tokio::test]
    async fn garbage_and_unknown_kinds_are_counted() {
        let control = spawn_local().await;
        let addr = control.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Unencrypted garbage.
        sender.send_to(b"not encrypted at all", addr).await.unwrap();
        // Well-encrypted, but not connectionless.
        sender
            .send_to(&crypto::seal(b"\x01\x02\x03\x04plain"), addr)
            .await
            .unwrap();
        // Connectionless, but an unhandled kind.
        sender
            .send_to(&crypto::seal(b"\xff\xff\xff\xffZwho knows"), addr)
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while control.dropped_datagrams() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("all three datagrams should be counted as dropped");
    }
}
