//! Broker bookkeeping: subject logs, sessions and delivery units.

use crate::subject;
use crate::subscriptions::SubscriptionId;
use crate::transport::{ClientFrame, ConnectRejection, ServerFrame, SubscribeRejection};
use crate::types::{Message, Sequence, StartPosition, Timestamp};
use crossbeam_channel::Sender;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use super::BrokerConfig;

pub(crate) type ConnId = u64;

/// A subscription member as the broker sees it: connection plus inbox.
type MemberKey = (ConnId, SubscriptionId);

/// Append-only log for one subject. Sequences start at 1 and are dense.
#[derive(Default)]
pub(crate) struct SubjectLog {
    messages: Vec<Message>,
}

impl SubjectLog {
    fn last_sequence(&self) -> Sequence {
        self.messages.last().map(|m| m.sequence).unwrap_or_default()
    }

    fn append(&mut self, subject: String, payload: Vec<u8>) -> Sequence {
        let sequence = self.last_sequence().next();
        self.messages.push(Message {
            subject,
            payload,
            sequence,
            timestamp: Timestamp::now(),
            redelivered: false,
        });
        sequence
    }

    fn get(&self, sequence: Sequence) -> Option<&Message> {
        let index = sequence.prev()?.0 as usize;
        self.messages.get(index)
    }

    /// First message after the cursor.
    fn after(&self, cursor: Sequence) -> Option<&Message> {
        self.messages.get(cursor.0 as usize)
    }

    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    /// Cursor (last delivered sequence) that makes delivery begin at `start`.
    fn cursor_for(&self, start: StartPosition) -> Sequence {
        match start {
            StartPosition::NewOnly => self.last_sequence(),
            StartPosition::LastReceived => self.last_sequence().prev().unwrap_or_default(),
            StartPosition::FromSequence(seq) => seq.prev().unwrap_or_default(),
            StartPosition::FromTime(ts) => self
                .messages
                .iter()
                .take_while(|m| m.timestamp < ts)
                .last()
                .map(|m| m.sequence)
                .unwrap_or_default(),
            StartPosition::AllAvailable => Sequence(0),
        }
    }
}

/// A dialed connection.
struct Session {
    client_id: Option<String>,
    outbound: Sender<ServerFrame>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum UnitKey {
    Plain(MemberKey),
    Durable {
        client_id: String,
        durable: String,
        subject: String,
    },
    Queue {
        subject: String,
        group: String,
        durable: Option<String>,
    },
}

struct Member {
    key: MemberKey,
    inflight: usize,
    max_inflight: usize,
    ack_wait: Duration,
}

struct Inflight {
    /// None once the member it was sent to has left.
    member: Option<MemberKey>,
    sent_at: Instant,
}

/// Shared cursor state for a plain subscription, a durable, or a queue
/// group. Every message matched by the unit goes to exactly one member.
struct DeliveryUnit {
    pattern: String,
    start: StartPosition,
    durable: bool,
    members: Vec<Member>,
    next_member: usize,
    /// Last sequence handed out per subject.
    cursors: HashMap<String, Sequence>,
    inflight: BTreeMap<(String, Sequence), Inflight>,
}

impl DeliveryUnit {
    fn new(
        pattern: String,
        start: StartPosition,
        durable: bool,
        subjects: &BTreeMap<String, SubjectLog>,
    ) -> Self {
        let cursors = subjects
            .iter()
            .filter(|(name, _)| subject::matches(&pattern, name))
            .map(|(name, log)| (name.clone(), log.cursor_for(start)))
            .collect();

        Self {
            pattern,
            start,
            durable,
            members: Vec::new(),
            next_member: 0,
            cursors,
            inflight: BTreeMap::new(),
        }
    }

    /// Cursor for a subject that appeared after the unit was created.
    fn initial_cursor(&self, log: &SubjectLog) -> Sequence {
        match self.start {
            StartPosition::FromSequence(_) | StartPosition::FromTime(_) => {
                log.cursor_for(self.start)
            }
            _ => Sequence(0),
        }
    }

    /// Round-robin over members that still have capacity.
    fn pick_member(&mut self) -> Option<usize> {
        let count = self.members.len();
        for offset in 0..count {
            let idx = (self.next_member + offset) % count;
            if self.members[idx].inflight < self.members[idx].max_inflight {
                self.next_member = (idx + 1) % count;
                return Some(idx);
            }
        }
        None
    }

    fn release_slot(&mut self, member: MemberKey) {
        if let Some(m) = self.members.iter_mut().find(|m| m.key == member) {
            m.inflight = m.inflight.saturating_sub(1);
        }
    }
}

fn send_message(
    sessions: &HashMap<ConnId, Session>,
    member: MemberKey,
    message: &Message,
    redelivered: bool,
) {
    let (conn, inbox) = member;
    if let Some(session) = sessions.get(&conn) {
        let message = Message {
            redelivered,
            ..message.clone()
        };
        let _ = session.outbound.send(ServerFrame::Deliver { inbox, message });
    }
}

/// Hand out orphaned and new messages until members run out of capacity.
fn pump(
    unit: &mut DeliveryUnit,
    subjects: &BTreeMap<String, SubjectLog>,
    sessions: &HashMap<ConnId, Session>,
) {
    if unit.members.is_empty() {
        return;
    }

    let orphans: Vec<(String, Sequence)> = unit
        .inflight
        .iter()
        .filter(|(_, entry)| entry.member.is_none())
        .map(|(key, _)| key.clone())
        .collect();

    for key in orphans {
        let Some(message) = subjects.get(&key.0).and_then(|log| log.get(key.1)) else {
            unit.inflight.remove(&key);
            continue;
        };
        let Some(idx) = unit.pick_member() else {
            return;
        };
        let member = unit.members[idx].key;
        unit.members[idx].inflight += 1;
        unit.inflight.insert(
            key,
            Inflight {
                member: Some(member),
                sent_at: Instant::now(),
            },
        );
        send_message(sessions, member, message, true);
    }

    let pattern = unit.pattern.clone();
    for (name, log) in subjects
        .iter()
        .filter(|(name, _)| subject::matches(&pattern, name))
    {
        loop {
            let cursor = match unit.cursors.get(name) {
                Some(cursor) => *cursor,
                None => {
                    let cursor = unit.initial_cursor(log);
                    unit.cursors.insert(name.clone(), cursor);
                    cursor
                }
            };
            let Some(message) = log.after(cursor) else {
                break;
            };
            let Some(idx) = unit.pick_member() else {
                return;
            };
            let member = unit.members[idx].key;
            unit.members[idx].inflight += 1;
            unit.cursors.insert(name.clone(), message.sequence);
            unit.inflight.insert(
                (name.clone(), message.sequence),
                Inflight {
                    member: Some(member),
                    sent_at: Instant::now(),
                },
            );
            send_message(sessions, member, message, false);
        }
    }
}

/// Everything the broker knows, guarded by one lock.
#[derive(Default)]
pub(crate) struct BrokerState {
    subjects: BTreeMap<String, SubjectLog>,
    sessions: HashMap<ConnId, Session>,
    /// Client id to the connection holding it.
    clients: HashMap<String, ConnId>,
    units: HashMap<UnitKey, DeliveryUnit>,
    memberships: HashMap<MemberKey, UnitKey>,
    /// Requests are still applied but their replies are discarded.
    drop_replies: bool,
}

impl BrokerState {
    pub(crate) fn open_session(&mut self, conn: ConnId, outbound: Sender<ServerFrame>) {
        self.sessions.insert(
            conn,
            Session {
                client_id: None,
                outbound,
            },
        );
    }

    pub(crate) fn is_open(&self, conn: ConnId) -> bool {
        self.sessions.contains_key(&conn)
    }

    /// Drop a connection. Its outbound channel closes with it.
    pub(crate) fn close_session(&mut self, conn: ConnId) {
        self.release(conn);
        self.sessions.remove(&conn);
    }

    pub(crate) fn conn_for_client(&self, client_id: &str) -> Option<ConnId> {
        self.clients.get(client_id).copied()
    }

    pub(crate) fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub(crate) fn message_count(&self, subject: &str) -> usize {
        self.subjects.get(subject).map(SubjectLog::len).unwrap_or(0)
    }

    pub(crate) fn has_durable(&self, client_id: &str, durable: &str, subject: &str) -> bool {
        self.units.contains_key(&UnitKey::Durable {
            client_id: client_id.to_string(),
            durable: durable.to_string(),
            subject: subject.to_string(),
        })
    }

    pub(crate) fn inflight_count(&self) -> usize {
        self.units.values().map(|u| u.inflight.len()).sum()
    }

    pub(crate) fn handle(&mut self, conn: ConnId, frame: ClientFrame, config: &BrokerConfig) {
        match frame {
            ClientFrame::Connect {
                request_id,
                cluster_id,
                client_id,
                token,
            } => {
                // No responder for other clusters; the client times out.
                if cluster_id != config.cluster_id {
                    tracing::debug!(%cluster_id, "connect for unknown cluster ignored");
                    return;
                }
                let result = self.connect(conn, client_id, token, config);
                self.reply(conn, ServerFrame::ConnectReply { request_id, result });
            }
            ClientFrame::Publish {
                guid,
                subject,
                payload,
            } => self.publish(conn, guid, subject, payload, config),
            ClientFrame::Subscribe {
                request_id,
                inbox,
                subject,
                queue_group,
                durable_name,
                start,
                max_inflight,
                ack_wait_ms,
            } => {
                let result = self.subscribe(
                    (conn, inbox),
                    subject,
                    queue_group,
                    durable_name,
                    start,
                    max_inflight,
                    Duration::from_millis(ack_wait_ms),
                );
                let error = result.as_ref().err().cloned();
                self.reply(conn, ServerFrame::SubscribeReply { request_id, error });
                if let Ok(key) = result {
                    self.pump_unit(&key);
                }
            }
            ClientFrame::Unsubscribe {
                request_id,
                inbox,
                subject,
                queue_group,
                durable_name,
                close_durable,
            } => {
                let error = self
                    .unsubscribe(conn, inbox, subject, queue_group, durable_name, close_durable)
                    .err();
                self.reply(conn, ServerFrame::UnsubscribeReply { request_id, error });
            }
            ClientFrame::Ack {
                inbox,
                subject,
                sequence,
            } => self.ack((conn, inbox), subject, sequence),
            ClientFrame::Ping { id } => self.reply(conn, ServerFrame::Pong { id }),
            ClientFrame::Close { request_id } => {
                self.release(conn);
                self.reply(conn, ServerFrame::CloseReply { request_id });
            }
        }
    }

    pub(crate) fn set_drop_replies(&mut self, drop_replies: bool) {
        self.drop_replies = drop_replies;
    }

    fn reply(&self, conn: ConnId, frame: ServerFrame) {
        if self.drop_replies && frame.request_id().is_some() {
            tracing::trace!(conn, ?frame, "reply dropped");
            return;
        }
        if let Some(session) = self.sessions.get(&conn) {
            let _ = session.outbound.send(frame);
        }
    }

    fn connect(
        &mut self,
        conn: ConnId,
        client_id: String,
        token: Option<String>,
        config: &BrokerConfig,
    ) -> Result<usize, ConnectRejection> {
        if config.token.is_some() && token != config.token {
            return Err(ConnectRejection::AuthFailed);
        }
        if let Some(existing) = self.clients.get(&client_id) {
            if *existing != conn && self.sessions.contains_key(existing) {
                return Err(ConnectRejection::DuplicateClientId);
            }
        }
        let Some(session) = self.sessions.get_mut(&conn) else {
            return Err(ConnectRejection::Other("connection is closed".to_string()));
        };
        session.client_id = Some(client_id.clone());
        self.clients.insert(client_id, conn);
        Ok(config.max_payload)
    }

    fn publish(
        &mut self,
        conn: ConnId,
        guid: u64,
        subject: String,
        payload: Vec<u8>,
        config: &BrokerConfig,
    ) {
        let registered = self
            .sessions
            .get(&conn)
            .map(|s| s.client_id.is_some())
            .unwrap_or(false);

        let result = if !registered {
            Err("client is not connected".to_string())
        } else if payload.len() > config.max_payload {
            Err(format!("maximum payload is {} bytes", config.max_payload))
        } else {
            subject::validate_subject(&subject).map(|()| {
                self.subjects
                    .entry(subject.clone())
                    .or_default()
                    .append(subject.clone(), payload)
            })
        };

        let stored = result.is_ok();
        self.reply(conn, ServerFrame::PubAck { guid, result });

        if stored {
            let subjects = &self.subjects;
            let sessions = &self.sessions;
            for unit in self
                .units
                .values_mut()
                .filter(|u| subject::matches(&u.pattern, &subject))
            {
                pump(unit, subjects, sessions);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn subscribe(
        &mut self,
        member: MemberKey,
        subject: String,
        queue_group: Option<String>,
        durable_name: Option<String>,
        start: StartPosition,
        max_inflight: usize,
        ack_wait: Duration,
    ) -> Result<UnitKey, SubscribeRejection> {
        subject::validate_pattern(&subject).map_err(SubscribeRejection::SubjectInvalid)?;

        let client_id = self
            .sessions
            .get(&member.0)
            .and_then(|s| s.client_id.clone())
            .ok_or_else(|| SubscribeRejection::Other("client is not connected".to_string()))?;

        if self.memberships.contains_key(&member) {
            return Err(SubscribeRejection::Other(format!(
                "inbox {} already in use",
                member.1
            )));
        }

        let durable = durable_name.is_some();
        let key = match (queue_group, durable_name) {
            (Some(group), durable) => UnitKey::Queue {
                subject: subject.clone(),
                group,
                durable,
            },
            (None, Some(durable)) => UnitKey::Durable {
                client_id,
                durable,
                subject: subject.clone(),
            },
            (None, None) => UnitKey::Plain(member),
        };

        if let UnitKey::Durable { durable, .. } = &key {
            if self.units.get(&key).is_some_and(|u| !u.members.is_empty()) {
                return Err(SubscribeRejection::DuplicateDurable(durable.clone()));
            }
        }

        let subjects = &self.subjects;
        let unit = self
            .units
            .entry(key.clone())
            .or_insert_with(|| DeliveryUnit::new(subject, start, durable, subjects));
        unit.members.push(Member {
            key: member,
            inflight: 0,
            max_inflight: max_inflight.max(1),
            ack_wait,
        });
        self.memberships.insert(member, key.clone());

        Ok(key)
    }

    fn unsubscribe(
        &mut self,
        conn: ConnId,
        inbox: SubscriptionId,
        subject: String,
        queue_group: Option<String>,
        durable_name: Option<String>,
        close_durable: bool,
    ) -> Result<(), String> {
        if self.detach((conn, inbox), close_durable).is_some() || !close_durable {
            return Ok(());
        }

        // Erasing a durable whose last member already left.
        let client_id = self
            .sessions
            .get(&conn)
            .and_then(|s| s.client_id.clone())
            .ok_or_else(|| "client is not connected".to_string())?;
        let key = match (queue_group, durable_name) {
            (Some(group), Some(durable)) => UnitKey::Queue {
                subject,
                group,
                durable: Some(durable),
            },
            (None, Some(durable)) => UnitKey::Durable {
                client_id,
                durable,
                subject,
            },
            _ => return Ok(()),
        };
        if self.units.get(&key).is_some_and(|u| u.members.is_empty()) {
            self.units.remove(&key);
        }
        Ok(())
    }

    /// Remove a member. Its in-flight messages become orphans for the
    /// next member. Empty units go away unless durable state is kept.
    fn detach(&mut self, member: MemberKey, close_durable: bool) -> Option<UnitKey> {
        let key = self.memberships.remove(&member)?;

        let remove = match self.units.get_mut(&key) {
            Some(unit) => {
                unit.members.retain(|m| m.key != member);
                unit.next_member = 0;
                for entry in unit.inflight.values_mut() {
                    if entry.member == Some(member) {
                        entry.member = None;
                    }
                }
                unit.members.is_empty() && (close_durable || !unit.durable)
            }
            None => false,
        };

        if remove {
            self.units.remove(&key);
        } else {
            self.pump_unit(&key);
        }
        Some(key)
    }

    fn ack(&mut self, member: MemberKey, subject: String, sequence: Sequence) {
        let Some(key) = self.memberships.get(&member) else {
            return;
        };
        let Some(unit) = self.units.get_mut(key) else {
            return;
        };
        if let Some(entry) = unit.inflight.remove(&(subject, sequence)) {
            if let Some(holder) = entry.member {
                unit.release_slot(holder);
            }
        }
        pump(unit, &self.subjects, &self.sessions);
    }

    fn pump_unit(&mut self, key: &UnitKey) {
        if let Some(unit) = self.units.get_mut(key) {
            pump(unit, &self.subjects, &self.sessions);
        }
    }

    /// Detach every member of a connection and free its client id.
    fn release(&mut self, conn: ConnId) {
        let members: Vec<MemberKey> = self
            .memberships
            .keys()
            .filter(|(c, _)| *c == conn)
            .copied()
            .collect();
        for member in members {
            self.detach(member, false);
        }

        let client_id = self.sessions.get_mut(&conn).and_then(|s| s.client_id.take());
        if let Some(client_id) = client_id {
            if self.clients.get(&client_id) == Some(&conn) {
                self.clients.remove(&client_id);
            }
        }
    }

    /// Resend messages whose ack wait elapsed to the member holding them.
    pub(crate) fn redeliver_expired(&mut self, now: Instant) {
        let subjects = &self.subjects;
        let sessions = &self.sessions;

        for unit in self.units.values_mut() {
            let members = &unit.members;
            for ((subject, sequence), entry) in unit.inflight.iter_mut() {
                let Some(holder) = entry.member else {
                    continue;
                };
                let Some(member) = members.iter().find(|m| m.key == holder) else {
                    continue;
                };
                if now.saturating_duration_since(entry.sent_at) < member.ack_wait {
                    continue;
                }
                if let Some(message) = subjects.get(subject).and_then(|log| log.get(*sequence)) {
                    tracing::trace!(%subject, %sequence, "redelivering unacknowledged message");
                    send_message(sessions, holder, message, true);
                    entry.sent_at = now;
                }
            }
        }
    }
}
