use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use hickory_proto::op::Message;

/// Response cache for the DNS proxy, with a resolved side (question to full
/// response) and a negative-existence side (question to marker). The two
/// sides are disjoint: registering a question on one side removes it from
/// the other. A single process-global TTL covers every entry.
pub struct AnswerCache {
    ttl: i64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    resolved: HashMap<String, CachedAnswer>,
    nx: HashMap<String, Instant>,
}

struct CachedAnswer {
    response: Message,
    inserted: Instant,
}

/// Canonical cache key: the first question name with the trailing dot
/// stripped, case preserved.
pub fn question_key(msg: &Message) -> Option<String> {
    msg.queries()
        .first()
        .map(|q| q.name().to_string().trim_end_matches('.').to_string())
}

impl AnswerCache {
    /// A TTL of zero or below disables caching.
    pub fn new(ttl: i64) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn ttl(&self) -> i64 {
        self.ttl
    }

    pub fn enabled(&self) -> bool {
        self.ttl > 0
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.ttl.max(0) as u64)
    }

    pub fn exists(&self, question: &str) -> bool {
        self.inner.lock().unwrap().resolved.contains_key(question)
    }

    pub fn has_expired(&self, question: &str) -> bool {
        match self.inner.lock().unwrap().resolved.get(question) {
            Some(entry) => entry.inserted.elapsed() > self.window(),
            None => true,
        }
    }

    pub fn get(&self, question: &str) -> Option<Message> {
        self.inner
            .lock()
            .unwrap()
            .resolved
            .get(question)
            .map(|entry| entry.response.clone())
    }

    /// Store a resolved response. No-op if the question is already present;
    /// any NX marker for it is dropped first.
    pub fn register(&self, question: &str, response: &Message) {
        let mut inner = self.inner.lock().unwrap();
        inner.nx.remove(question);
        if inner.resolved.contains_key(question) {
            return;
        }
        inner.resolved.insert(
            question.to_string(),
            CachedAnswer {
                response: response.clone(),
                inserted: Instant::now(),
            },
        );
    }

    pub fn renew(&self, question: &str, response: &Message) {
        let mut inner = self.inner.lock().unwrap();
        inner.nx.remove(question);
        inner.resolved.insert(
            question.to_string(),
            CachedAnswer {
                response: response.clone(),
                inserted: Instant::now(),
            },
        );
    }

    pub fn delete(&self, question: &str) {
        self.inner.lock().unwrap().resolved.remove(question);
    }

    pub fn expired_queries(&self) -> Vec<String> {
        let window = self.window();
        self.inner
            .lock()
            .unwrap()
            .resolved
            .iter()
            .filter(|(_, entry)| entry.inserted.elapsed() > window)
            .map(|(question, _)| question.clone())
            .collect()
    }

    pub fn exists_nx(&self, question: &str) -> bool {
        self.inner.lock().unwrap().nx.contains_key(question)
    }

    pub fn has_expired_nx(&self, question: &str) -> bool {
        match self.inner.lock().unwrap().nx.get(question) {
            Some(inserted) => inserted.elapsed() > self.window(),
            None => true,
        }
    }

    /// Mark a question as negative. No-op if already marked; any resolved
    /// entry for it is dropped first.
    pub fn register_nx(&self, question: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.resolved.remove(question);
        if inner.nx.contains_key(question) {
            return;
        }
        inner.nx.insert(question.to_string(), Instant::now());
    }

    pub fn renew_nx(&self, question: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.resolved.remove(question);
        inner.nx.insert(question.to_string(), Instant::now());
    }

    pub fn delete_nx(&self, question: &str) {
        self.inner.lock().unwrap().nx.remove(question);
    }

    pub fn expired_nx(&self) -> Vec<String> {
        let window = self.window();
        self.inner
            .lock()
            .unwrap()
            .nx
            .iter()
            .filter(|(_, inserted)| inserted.elapsed() > window)
            .map(|(question, _)| question.clone())
            .collect()
    }
}
