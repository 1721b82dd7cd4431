//! Cache-aware forwarding: the per-message pipeline between a client query
//! and the upstream response.

use std::net::{Ipv4Addr, Ipv6Addr};

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use tracing::{debug, error, info, warn};

use super::cache::question_key;
use super::Server;

impl Server {
    /// Handle one raw DNS message and produce the raw response, or `None`
    /// for payloads that do not parse at all. Reentrant; invoked
    /// concurrently for distinct messages.
    pub(crate) async fn handle_payload(&self, payload: &[u8]) -> Option<Vec<u8>> {
        let req = match Message::from_vec(payload) {
            Ok(req) => req,
            Err(err) => {
                warn!(error = %err, "Failed to parse DNS message");
                return None;
            }
        };
        let response = self.resolve(&req).await;
        match response.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                error!(error = %err, "Failed to serialise DNS response");
                None
            }
        }
    }

    async fn resolve(&self, req: &Message) -> Message {
        if req.queries().is_empty() {
            warn!("Invalid query, no questions");
            return servfail(req);
        }
        if req.queries().len() > 1 {
            let questions = req
                .queries()
                .iter()
                .map(|q| q.name().to_string())
                .collect::<Vec<_>>()
                .join(" ");
            warn!(questions, "Batched questions are not supported");
            return servfail(req);
        }

        let question = question_key(req).unwrap_or_default();
        if self.domain_blacklist.contains(&question) {
            info!(question, "Domain is blacklisted");
            return servfail(req);
        }

        // The IPv6 path is intentionally stateless: AAAA answers are never
        // authorized, so they are never cached either.
        let cacheable = self.cache.enabled() && req.queries()[0].query_type() != RecordType::AAAA;

        if cacheable {
            if self.cache.exists(&question) {
                if self.cache.has_expired(&question) {
                    debug!(question, "Cached answer expired");
                    self.cache.delete(&question);
                } else if let Some(mut cached) = self.cache.get(&question) {
                    debug!(question, "Serving cached answer");
                    cached.set_id(req.id());
                    self.authorizer.handle_response(&cached).await;
                    return cached;
                }
            }
            if self.cache.exists_nx(&question) {
                if !self.cache.has_expired_nx(&question) {
                    debug!(question, "Serving cached negative answer");
                    let mut echo = req.clone();
                    echo.set_message_type(MessageType::Response);
                    self.authorizer.handle_response(&echo).await;
                    return echo;
                }
                debug!(question, "Cached negative answer expired");
                self.cache.delete_nx(&question);
            }
        }

        let response = match self.upstream.exchange(req).await {
            Ok(response) => response,
            Err(err) => {
                error!(question, error = %err, "Upstream exchange failed");
                self.cache.register_nx(&question);
                return servfail(req);
            }
        };

        if cacheable {
            self.push_to_cache(&question, &response);
        }
        self.authorizer.handle_response(&response).await;
        response
    }

    /// Classify a fresh upstream response: empty or sinkholed answers go to
    /// the NX side, everything else is stored as resolved.
    fn push_to_cache(&self, question: &str, response: &Message) {
        // AAAA answers are never cached even when non-empty.
        if response.queries().first().map(|q| q.query_type()) == Some(RecordType::AAAA) {
            return;
        }

        if is_negative(response) {
            if self.cache.exists_nx(question) {
                if self.cache.has_expired_nx(question) {
                    self.cache.renew_nx(question);
                }
                return;
            }
            self.cache.register_nx(question);
            return;
        }

        if self.cache.exists(question) {
            if self.cache.has_expired(question) {
                self.cache.renew(question, response);
            }
            return;
        }
        self.cache.register(question, response);
    }
}

/// Empty answer sections and single-answer sinkholes cache as negative.
fn is_negative(response: &Message) -> bool {
    let answers = response.answers();
    if answers.is_empty() {
        return true;
    }
    if answers.len() == 1 {
        match answers[0].data() {
            Some(RData::A(a)) => return a.0 == Ipv4Addr::UNSPECIFIED,
            Some(RData::AAAA(aaaa)) => return aaaa.0 == Ipv6Addr::UNSPECIFIED,
            _ => {}
        }
    }
    false
}

/// SERVFAIL carrying the request's ID and question section.
fn servfail(req: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(req.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(req.op_code());
    response.set_recursion_desired(req.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(ResponseCode::ServFail);
    response.add_queries(req.queries().to_vec());
    response
}
