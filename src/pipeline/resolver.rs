//! Recipient resolution.
//!
//! Turns one inbound mail into grouped [`SendJob`]s:
//!
//! 1. Recipients outside the mailer domain are dropped.
//! 2. A literal alias delivers to its owner, from the sender's synthetic address.
//!    A sender that cannot be wrapped aborts the request.
//! 3. A forward-capable synthetic address sent by the owner of its alias goes
//!    out to the decoded destination, from the alias.
//! 4. Everything else is dropped without error.
//!
//! Thread tokens are bound to the external correspondent of each job: the
//! sender for deliveries, the decoded destination for forwards. That keeps
//! the same identity on both sides of a conversation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use super::headers::{display_name, format_mailbox, mailbox_address};
use super::types::{InboundMail, SendJob};
use crate::address::{AddressForm, AddressTranscoder, SyntheticAddress, split_address};
use crate::directory::AliasDirectory;
use crate::error::RouteError;
use crate::message_id::MessageIdCipher;

/// Jobs are coalesced on this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum GroupKey {
    /// Inbound to alias owners.
    Delivery {
        from: String,
        reply_to: Option<String>,
    },
    /// Second hop out through an alias.
    Forward {
        alias: String,
        destination: String,
        reply_to: Option<String>,
    },
}

struct Group {
    from: String,
    reply_to: Option<String>,
    /// Identity the thread tokens of this job are bound to.
    peer: String,
    to: Vec<String>,
}

impl Group {
    fn add(&mut self, destination: &str) {
        self.to.push(destination.to_string());
    }
}

/// Routes inbound mail through the directory, transcoder and cipher.
pub struct Resolver {
    transcoder: AddressTranscoder,
    cipher: Arc<MessageIdCipher>,
    directory: Arc<AliasDirectory>,
    allow_outbound: bool,
    default_name: String,
}

impl Resolver {
    pub fn new(
        transcoder: AddressTranscoder,
        cipher: Arc<MessageIdCipher>,
        directory: Arc<AliasDirectory>,
        allow_outbound: bool,
        default_name: impl Into<String>,
    ) -> Self {
        Self {
            transcoder,
            cipher,
            directory,
            allow_outbound,
            default_name: default_name.into(),
        }
    }

    fn form(&self) -> AddressForm {
        AddressForm::for_forwarding(self.allow_outbound)
    }

    /// Resolve `mail` into send jobs.
    ///
    /// Returns an empty list when no recipient is routable. Errors abort the
    /// whole request and nothing must be sent.
    pub fn resolve(&self, mail: &InboundMail) -> Result<Vec<SendJob>, RouteError> {
        let sender = mail.sender.trim();
        let reply_to = mail
            .reply_to
            .as_deref()
            .and_then(mailbox_address);

        let mut order: Vec<GroupKey> = Vec::new();
        let mut groups: HashMap<GroupKey, Group> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut dropped = 0usize;

        for recipient in mail.recipients.split(',').map(str::trim) {
            // One destination per recipient; a recipient listed twice counts once.
            if recipient.is_empty() || !seen.insert(recipient.to_ascii_lowercase()) {
                continue;
            }
            let Some((local, domain)) = split_address(recipient) else {
                dropped += 1;
                continue;
            };
            if !self.transcoder.is_mailer_domain(domain) {
                dropped += 1;
                continue;
            }

            if let Some(owner) = self.directory.lookup(local) {
                let alias = local.to_ascii_lowercase();
                let synthetic = self
                    .transcoder
                    .wrap_as(sender, self.form(), &alias)
                    .map_err(RouteError::HardWrap)?;
                let reply_to = reply_to
                    .as_deref()
                    .and_then(|r| self.wrap_reply_to(r, &alias, false));

                let from = format_mailbox(
                    &display_name(mail.from_header.as_deref(), &self.default_name),
                    &synthetic,
                );
                let key = GroupKey::Delivery {
                    from: from.clone(),
                    reply_to: reply_to.clone(),
                };
                let owner = owner.to_string();
                groups
                    .entry(key.clone())
                    .or_insert_with(|| {
                        order.push(key);
                        Group {
                            from,
                            reply_to,
                            peer: sender.to_string(),
                            to: Vec::new(),
                        }
                    })
                    .add(&owner);
                continue;
            }

            match self.forward_target(recipient, sender) {
                Some((alias, destination)) => {
                    let reply_to = reply_to
                        .as_deref()
                        .and_then(|r| self.wrap_reply_to(r, &alias, true));
                    let from = format_mailbox(
                        &alias,
                        &format!("{alias}@{}", self.transcoder.mailer_domain()),
                    );
                    let key = GroupKey::Forward {
                        alias: alias.clone(),
                        destination: destination.to_ascii_lowercase(),
                        reply_to: reply_to.clone(),
                    };
                    groups
                        .entry(key.clone())
                        .or_insert_with(|| {
                            order.push(key);
                            Group {
                                from,
                                reply_to,
                                peer: destination.clone(),
                                to: Vec::new(),
                            }
                        })
                        .add(&destination);
                }
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            debug!(dropped, "Dropped unroutable recipients");
        }

        // Jobs verify the token against their own peer. Without jobs the
        // token must still belong to the sender.
        if groups.is_empty() {
            if let Some(token) = non_empty(mail.in_reply_to.as_deref()) {
                self.cipher
                    .decrypt(token, sender)
                    .map_err(RouteError::ThreadToken)?;
            }
        }

        order
            .into_iter()
            .filter_map(|key| groups.remove(&key))
            .map(|group| self.build_job(mail, group))
            .collect()
    }

    /// Decode a second-hop recipient. Only the owner of the embedded alias
    /// may send through it, and only while forwarding is enabled.
    fn forward_target(&self, recipient: &str, sender: &str) -> Option<(String, String)> {
        if !self.allow_outbound || !self.directory.is_owner(sender) {
            return None;
        }
        match self.transcoder.decode(recipient) {
            Ok(SyntheticAddress::ForwardCapable { target, alias }) => {
                let alias = alias.to_ascii_lowercase();
                if self.directory.owns_alias(sender, &alias) {
                    Some((alias, target))
                } else {
                    debug!(alias = %alias, "Sender does not own forwarding alias");
                    None
                }
            }
            Ok(SyntheticAddress::Simple { .. }) => {
                debug!("Simple synthetic address carries no alias");
                None
            }
            Err(e) => {
                debug!(error = %e, "Recipient is not a synthetic address");
                None
            }
        }
    }

    /// Wrap an optional reply-to. Failure only omits the header.
    fn wrap_reply_to(&self, reply_to: &str, alias: &str, forward_hop: bool) -> Option<String> {
        // On the way out, an owner's own address must never reach the peer.
        if forward_hop && self.directory.is_owner(reply_to) {
            debug!("Reply-To is a member address; omitting");
            return None;
        }
        match self.transcoder.wrap_as(reply_to, self.form(), alias) {
            Ok(wrapped) => Some(wrapped),
            Err(e) => {
                warn!(error = %e, "Reply-To could not be wrapped; omitting");
                None
            }
        }
    }

    fn build_job(&self, mail: &InboundMail, group: Group) -> Result<SendJob, RouteError> {
        let in_reply_to = match non_empty(mail.in_reply_to.as_deref()) {
            Some(token) => Some(
                self.cipher
                    .decrypt(token, &group.peer)
                    .map_err(RouteError::ThreadToken)?,
            ),
            None => None,
        };

        let original_id = non_empty(mail.message_id.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("<{}@{}>", Uuid::new_v4(), self.transcoder.mailer_domain())
            });
        let message_id = self
            .cipher
            .encrypt(&original_id, &group.peer)
            .map_err(RouteError::MessageIdEncode)?;

        Ok(SendJob {
            from: group.from,
            to: group.to,
            subject: mail.subject.clone(),
            text: non_empty(mail.body_plain.as_deref()).map(str::to_string),
            html: non_empty(mail.body_html.as_deref()).map(str::to_string),
            message_id,
            in_reply_to,
            reply_to: group.reply_to,
            attachments: mail.attachments.clone(),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
