//! Key broker: single-slot request/response channel to the key agent.
//!
//! ```text
//! engine                         broker                      agent
//!   fire_key(path, payload) ──▶  slot free? claim cookie ──▶ KeyAgent::next()
//!   (await, timeout)              │                           │
//!   ◀── EntityKey ───────────── respond(cookie, key) ◀───────┘
//! ```
//!
//! Only one request is in flight at a time. A caller that finds the slot busy
//! backs off and retries a bounded number of times. A response is accepted
//! only for the in-flight cookie; any other cookie fails the waiter. The
//! cookie advances whenever the slot is released and never takes the value 0.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use veil_core::config::BrokerConfig;
use veil_core::{CfsError, CfsResult, NormalizedPath};
use veil_crypto::EntityKey;

/// One request as seen by the key agent.
#[derive(Debug, Clone)]
pub struct KeyRequest {
    pub cookie: u32,
    pub path: NormalizedPath,
    pub payload: Vec<u8>,
    pub deadline: Instant,
}

/// Receiving end handed to the key agent on connect.
pub struct KeyAgent {
    requests: mpsc::UnboundedReceiver<KeyRequest>,
}

impl KeyAgent {
    /// Next request; `None` once the broker disconnected this agent.
    pub async fn next(&mut self) -> Option<KeyRequest> {
        self.requests.recv().await
    }

    pub fn try_next(&mut self) -> Option<KeyRequest> {
        self.requests.try_recv().ok()
    }
}

struct Slot {
    cookie: u32,
    reply: oneshot::Sender<CfsResult<EntityKey>>,
}

struct BrokerState {
    next_cookie: u32,
    in_flight: Option<Slot>,
    agent: Option<mpsc::UnboundedSender<KeyRequest>>,
}

impl BrokerState {
    fn advance(&mut self) {
        self.next_cookie = match self.next_cookie.wrapping_add(1) {
            0 => 1,
            c => c,
        };
    }
}

enum Claim {
    Sent(u32, oneshot::Receiver<CfsResult<EntityKey>>),
    Busy,
}

pub struct KeyBroker {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
}

impl KeyBroker {
    pub fn new(config: BrokerConfig) -> Self {
        KeyBroker {
            config,
            state: Mutex::new(BrokerState {
                next_cookie: 1,
                in_flight: None,
                agent: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a key agent, replacing any previous one.
    pub fn connect(&self) -> KeyAgent {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if state.agent.replace(tx).is_some() {
            tracing::info!("key agent replaced");
        } else {
            tracing::info!("key agent connected");
        }
        KeyAgent { requests: rx }
    }

    /// Detach the agent and fail the in-flight request, if any.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        state.agent = None;
        if let Some(slot) = state.in_flight.take() {
            let _ = slot.reply.send(Err(CfsError::KeyBrokerUnavailable));
            state.advance();
        }
        tracing::info!("key agent disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.lock().agent.is_some()
    }

    /// Cookie the next request will carry.
    pub fn next_cookie(&self) -> u32 {
        self.lock().next_cookie
    }

    pub fn in_flight(&self) -> Option<u32> {
        self.lock().in_flight.as_ref().map(|s| s.cookie)
    }

    /// Ask the agent for the entity key behind `payload`.
    pub async fn fire_key(&self, path: &NormalizedPath, payload: &[u8]) -> CfsResult<EntityKey> {
        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.claim(path, payload)? {
                Claim::Sent(cookie, reply) => return self.wait(cookie, reply).await,
                Claim::Busy => {
                    tracing::debug!(attempt, "key broker slot busy");
                    if attempt < attempts {
                        tokio::time::sleep(self.config.backoff()).await;
                    }
                }
            }
        }
        Err(CfsError::KeyBrokerBusy { attempts })
    }

    fn claim(&self, path: &NormalizedPath, payload: &[u8]) -> CfsResult<Claim> {
        let mut state = self.lock();
        if state.in_flight.is_some() {
            return Ok(Claim::Busy);
        }
        let Some(agent) = state.agent.as_ref() else {
            return Err(CfsError::KeyBrokerUnavailable);
        };
        let cookie = state.next_cookie;
        let request = KeyRequest {
            cookie,
            path: path.clone(),
            payload: payload.to_vec(),
            deadline: Instant::now() + self.config.timeout(),
        };
        if agent.send(request).is_err() {
            state.agent = None;
            tracing::warn!("key agent went away");
            return Err(CfsError::KeyBrokerUnavailable);
        }
        let (tx, rx) = oneshot::channel();
        state.in_flight = Some(Slot { cookie, reply: tx });
        tracing::debug!(cookie, path = %path, "key request sent");
        Ok(Claim::Sent(cookie, rx))
    }

    async fn wait(
        &self,
        cookie: u32,
        reply: oneshot::Receiver<CfsResult<EntityKey>>,
    ) -> CfsResult<EntityKey> {
        match tokio::time::timeout(self.config.timeout(), reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CfsError::KeyBrokerUnavailable),
            Err(_) => {
                let mut state = self.lock();
                if state.in_flight.as_ref().is_some_and(|s| s.cookie == cookie) {
                    state.in_flight = None;
                    state.advance();
                }
                tracing::warn!(cookie, timeout_ms = self.config.timeout_ms, "key request timed out");
                Err(CfsError::PolicyTimeout {
                    timeout_ms: self.config.timeout_ms,
                })
            }
        }
    }

    /// Deliver the agent's answer for `cookie`.
    pub fn respond(&self, cookie: u32, key: EntityKey) -> CfsResult<()> {
        self.finish(cookie, Ok(key))
    }

    /// The agent declined the request for `cookie`.
    pub fn reject(&self, cookie: u32, reason: &str) -> CfsResult<()> {
        self.finish(cookie, Err(CfsError::KeyRejected(reason.to_string())))
    }

    fn finish(&self, cookie: u32, outcome: CfsResult<EntityKey>) -> CfsResult<()> {
        let mut state = self.lock();
        let Some(slot) = state.in_flight.take() else {
            tracing::warn!(cookie, "key response with no request in flight");
            return Err(CfsError::StaleCookie {
                expected: 0,
                got: cookie,
            });
        };
        state.advance();
        if slot.cookie != cookie {
            let expected = slot.cookie;
            let _ = slot.reply.send(Err(CfsError::StaleCookie {
                expected,
                got: cookie,
            }));
            tracing::warn!(expected, got = cookie, "stale key response");
            return Err(CfsError::StaleCookie {
                expected,
                got: cookie,
            });
        }
        let _ = slot.reply.send(outcome);
        Ok(())
    }
}
