//! Reversible address wrapping.
//!
//! A true address `local@origin.tld` is hidden behind the mailer domain as
//! `local_at_origin.tld@mailer.tld` (simple form), or as
//! `local_at_origin.tld_alias@mailer.tld` (forward-capable form) when the
//! synthetic address should also route a reply back out through `alias`.
//!
//! Every operation fails closed with an [`AddressError`].

use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::directory::AliasDirectory;
use crate::error::AddressError;

/// Marker replacing `@` inside a wrapped local part.
pub const WRAP_MARKER: &str = "_at_";

/// Separator between the wrapped segment and the forwarding alias.
const ALIAS_SEPARATOR: char = '_';

static EMAIL_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r#"(?i)^(?:[a-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[a-z0-9!#$%&'*+/=?^_`{|}~-]+)*"#,
        r#"|"(?:[\x01-\x08\x0b\x0c\x0e-\x1f\x21\x23-\x5b\x5d-\x7f]|\\[\x01-\x09\x0b\x0c\x0e-\x7f])*")"#,
        r#"@(?:(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z0-9](?:[a-z0-9-]*[a-z0-9])?"#,
        r#"|\[(?:(?:25[0-5]|2[0-4][0-9]|1[0-9][0-9]|[1-9]?[0-9])\.){3}"#,
        r#"(?:25[0-5]|2[0-4][0-9]|1[0-9][0-9]|[1-9]?[0-9]"#,
        r#"|[a-z0-9-]*[a-z0-9]:(?:[\x01-\x08\x0b\x0c\x0e-\x1f\x21-\x5a\x53-\x7f]|\\[\x01-\x09\x0b\x0c\x0e-\x7f])+)\])$"#,
    ))
    .expect("email grammar is a valid regex")
});

/// Whether `address` is a syntactically valid `local@domain` address.
pub fn is_valid_email(address: &str) -> bool {
    EMAIL_GRAMMAR.is_match(address)
}

/// Split an address at its last `@`.
pub fn split_address(address: &str) -> Option<(&str, &str)> {
    address.rsplit_once('@')
}

/// Which synthetic form the relay mints for inbound senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressForm {
    /// Encodes the true address only.
    Simple,
    /// Also encodes the alias the owner can reply through.
    ForwardCapable,
}

impl AddressForm {
    /// Forward-capable addresses are only minted when outbound forwarding is on.
    pub fn for_forwarding(enabled: bool) -> Self {
        if enabled {
            AddressForm::ForwardCapable
        } else {
            AddressForm::Simple
        }
    }
}

/// A decoded synthetic address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntheticAddress {
    Simple { target: String },
    ForwardCapable { target: String, alias: String },
}

impl SyntheticAddress {
    /// The true address hidden inside.
    pub fn target(&self) -> &str {
        match self {
            SyntheticAddress::Simple { target } => target,
            SyntheticAddress::ForwardCapable { target, .. } => target,
        }
    }

    /// The forwarding alias, for the forward-capable form.
    pub fn alias(&self) -> Option<&str> {
        match self {
            SyntheticAddress::Simple { .. } => None,
            SyntheticAddress::ForwardCapable { alias, .. } => Some(alias),
        }
    }
}

/// Wraps and unwraps addresses under one mailer domain.
#[derive(Debug, Clone)]
pub struct AddressTranscoder {
    mailer_domain: String,
    directory: Arc<AliasDirectory>,
}

impl AddressTranscoder {
    pub fn new(mailer_domain: impl Into<String>, directory: Arc<AliasDirectory>) -> Self {
        Self {
            mailer_domain: mailer_domain.into(),
            directory,
        }
    }

    pub fn mailer_domain(&self) -> &str {
        &self.mailer_domain
    }

    /// Whether `domain` is the mailer domain (ASCII case-insensitive).
    pub fn is_mailer_domain(&self, domain: &str) -> bool {
        domain.eq_ignore_ascii_case(&self.mailer_domain)
    }

    /// Wrap `address` into the simple synthetic form.
    ///
    /// Addresses already under the mailer domain are returned unchanged when
    /// their local part is a known alias, and rejected otherwise.
    pub fn wrap(&self, address: &str) -> Result<String, AddressError> {
        self.wrap_with_suffix(address, None)
    }

    /// Wrap `address` into the forward-capable form routed through `alias`.
    pub fn wrap_forward(&self, address: &str, alias: &str) -> Result<String, AddressError> {
        if alias.is_empty() {
            return Err(AddressError::MissingAlias);
        }
        self.wrap_with_suffix(address, Some(alias))
    }

    /// Wrap `address` in the given form. `alias` is ignored for the simple form.
    pub fn wrap_as(
        &self,
        address: &str,
        form: AddressForm,
        alias: &str,
    ) -> Result<String, AddressError> {
        match form {
            AddressForm::Simple => self.wrap(address),
            AddressForm::ForwardCapable => self.wrap_forward(address, alias),
        }
    }

    fn wrap_with_suffix(&self, address: &str, alias: Option<&str>) -> Result<String, AddressError> {
        let address = address.trim();
        if !is_valid_email(address) {
            return Err(AddressError::InvalidGrammar);
        }
        let (local, domain) = split_address(address).ok_or(AddressError::InvalidGrammar)?;

        if self.is_mailer_domain(domain) {
            return if self.directory.contains_alias(local) {
                Ok(address.to_string())
            } else {
                Err(AddressError::UnknownAlias)
            };
        }

        let wrapped = match alias {
            Some(alias) => format!(
                "{local}{WRAP_MARKER}{domain}{ALIAS_SEPARATOR}{alias}@{}",
                self.mailer_domain
            ),
            None => format!("{local}{WRAP_MARKER}{domain}@{}", self.mailer_domain),
        };

        // Quoted local parts and address literals do not survive wrapping.
        if !is_valid_email(&wrapped) {
            return Err(AddressError::InvalidGrammar);
        }
        Ok(wrapped)
    }

    /// Recover the true address from a simple synthetic address.
    pub fn unwrap(&self, synthetic: &str) -> Result<String, AddressError> {
        let local = self.mailer_local_part(synthetic)?;
        self.decode_segment(local)
    }

    /// Recover the true address and forwarding alias from a forward-capable
    /// synthetic address.
    pub fn unwrap_forward(&self, synthetic: &str) -> Result<(String, String), AddressError> {
        let local = self.mailer_local_part(synthetic)?;

        let marker = local.rfind(WRAP_MARKER).ok_or(AddressError::NotWrapped)?;
        let tail_start = marker + WRAP_MARKER.len();
        // Domains never contain '_', so the first one after the marker starts the alias.
        let separator = local[tail_start..]
            .find(ALIAS_SEPARATOR)
            .map(|offset| tail_start + offset)
            .ok_or(AddressError::MissingAlias)?;

        let alias = &local[separator + ALIAS_SEPARATOR.len_utf8()..];
        if alias.is_empty() {
            return Err(AddressError::MissingAlias);
        }

        let target = self.decode_segment(&local[..separator])?;
        Ok((target, alias.to_string()))
    }

    /// Decode either synthetic form.
    pub fn decode(&self, synthetic: &str) -> Result<SyntheticAddress, AddressError> {
        match self.unwrap(synthetic) {
            Ok(target) => Ok(SyntheticAddress::Simple { target }),
            Err(AddressError::NestedDomain) => {
                let (target, alias) = self.unwrap_forward(synthetic)?;
                Ok(SyntheticAddress::ForwardCapable { target, alias })
            }
            Err(e) => Err(e),
        }
    }

    /// Render a decoded address back into its synthetic string.
    pub fn encode(&self, address: &SyntheticAddress) -> Result<String, AddressError> {
        match address {
            SyntheticAddress::Simple { target } => self.wrap(target),
            SyntheticAddress::ForwardCapable { target, alias } => self.wrap_forward(target, alias),
        }
    }

    /// Local part of `synthetic`, which must live under the mailer domain.
    fn mailer_local_part<'a>(&self, synthetic: &'a str) -> Result<&'a str, AddressError> {
        let synthetic = synthetic.trim();
        if !is_valid_email(synthetic) {
            return Err(AddressError::InvalidGrammar);
        }
        let (local, domain) = split_address(synthetic).ok_or(AddressError::InvalidGrammar)?;
        if !self.is_mailer_domain(domain) {
            return Err(AddressError::ForeignDomain);
        }
        Ok(local)
    }

    /// Turn `local_at_domain` back into `local@domain`.
    fn decode_segment(&self, encoded: &str) -> Result<String, AddressError> {
        let marker = encoded.rfind(WRAP_MARKER).ok_or(AddressError::NotWrapped)?;
        let local = &encoded[..marker];
        let domain = &encoded[marker + WRAP_MARKER.len()..];

        if local.is_empty() || domain.is_empty() {
            return Err(AddressError::NotWrapped);
        }
        if domain.contains('_') {
            return Err(AddressError::NestedDomain);
        }
        if self.is_mailer_domain(domain) && !self.directory.contains_alias(local) {
            return Err(AddressError::UnknownAlias);
        }

        let address = format!("{local}@{domain}");
        if !is_valid_email(&address) {
            return Err(AddressError::InvalidGrammar);
        }
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn transcoder() -> AddressTranscoder {
        let directory =
            AliasDirectory::from_entries([("support", "owner@real.tld"), ("help-desk", "owner@real.tld")])
                .unwrap();
        AddressTranscoder::new("proxy.tld", Arc::new(directory))
    }

    #[test]
    fn grammar_accepts_common_addresses() {
        assert!(is_valid_email("client@client.tld"));
        assert!(is_valid_email("First.Last+tag@Mail.Example.COM"));
        assert!(is_valid_email("\"quoted.name\"@example.com"));
        assert!(is_valid_email("root@[192.168.0.1]"));
    }

    #[test]
    fn grammar_rejects_garbage() {
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("no-at-sign"));
        assert!(!is_valid_email("a@b"));
        assert!(!is_valid_email("Name <a@b.tld>"));
        assert!(!is_valid_email("a@under_score.tld"));
        assert!(!is_valid_email("a..b@c.tld"));
        assert!(!is_valid_email("\"quoted name\"@example.com"));
    }

    #[test]
    fn wrap_simple() {
        let t = transcoder();
        assert_eq!(
            t.wrap("client@client.tld").unwrap(),
            "client_at_client.tld@proxy.tld"
        );
    }

    #[test]
    fn wrap_forward_appends_alias() {
        let t = transcoder();
        assert_eq!(
            t.wrap_forward("client@client.tld", "support").unwrap(),
            "client_at_client.tld_support@proxy.tld"
        );
        assert_eq!(
            t.wrap_forward("client@client.tld", ""),
            Err(AddressError::MissingAlias)
        );
    }

    #[test]
    fn wrap_as_selects_form() {
        let t = transcoder();
        assert_eq!(
            t.wrap_as("client@client.tld", AddressForm::Simple, "support").unwrap(),
            "client_at_client.tld@proxy.tld"
        );
        assert_eq!(
            t.wrap_as("client@client.tld", AddressForm::ForwardCapable, "support").unwrap(),
            "client_at_client.tld_support@proxy.tld"
        );
    }

    #[test]
    fn wrap_rejects_invalid_grammar() {
        let t = transcoder();
        assert_eq!(t.wrap("not an address"), Err(AddressError::InvalidGrammar));
        assert_eq!(t.wrap("\"a b\"@client.tld"), Err(AddressError::InvalidGrammar));
        assert_eq!(t.wrap("root@[10.0.0.1]"), Err(AddressError::InvalidGrammar));
    }

    #[test]
    fn wrap_self_domain_requires_alias() {
        let t = transcoder();
        assert_eq!(t.wrap("support@proxy.tld").unwrap(), "support@proxy.tld");
        assert_eq!(t.wrap("support@PROXY.tld").unwrap(), "support@PROXY.tld");
        assert_eq!(t.wrap("random@proxy.tld"), Err(AddressError::UnknownAlias));
        assert_eq!(
            t.wrap("client_at_client.tld@proxy.tld"),
            Err(AddressError::UnknownAlias)
        );
    }

    #[test]
    fn unwrap_simple() {
        let t = transcoder();
        assert_eq!(
            t.unwrap("client_at_client.tld@proxy.tld").unwrap(),
            "client@client.tld"
        );
    }

    #[test]
    fn unwrap_uses_rightmost_marker() {
        let t = transcoder();
        let wrapped = t.wrap("john_at_home@mail.tld").unwrap();
        assert_eq!(wrapped, "john_at_home_at_mail.tld@proxy.tld");
        assert_eq!(t.unwrap(&wrapped).unwrap(), "john_at_home@mail.tld");
    }

    #[test]
    fn unwrap_rejects_foreign_domain() {
        let t = transcoder();
        assert_eq!(
            t.unwrap("client_at_client.tld@elsewhere.tld"),
            Err(AddressError::ForeignDomain)
        );
    }

    #[test]
    fn unwrap_rejects_unmarked_local_part() {
        let t = transcoder();
        assert_eq!(t.unwrap("support@proxy.tld"), Err(AddressError::NotWrapped));
        assert_eq!(t.unwrap("_at_client.tld@proxy.tld"), Err(AddressError::NotWrapped));
        assert_eq!(t.unwrap("client_at_@proxy.tld"), Err(AddressError::NotWrapped));
    }

    #[test]
    fn unwrap_rejects_underscored_domain() {
        let t = transcoder();
        assert_eq!(
            t.unwrap("client_at_client.tld_support@proxy.tld"),
            Err(AddressError::NestedDomain)
        );
    }

    #[test]
    fn unwrap_self_domain_requires_alias() {
        let t = transcoder();
        assert_eq!(
            t.unwrap("support_at_proxy.tld@proxy.tld").unwrap(),
            "support@proxy.tld"
        );
        assert_eq!(
            t.unwrap("intruder_at_proxy.tld@proxy.tld"),
            Err(AddressError::UnknownAlias)
        );
    }

    #[test]
    fn unwrap_forward_recovers_alias() {
        let t = transcoder();
        assert_eq!(
            t.unwrap_forward("client_at_client.tld_support@proxy.tld").unwrap(),
            ("client@client.tld".to_string(), "support".to_string())
        );
    }

    #[test]
    fn unwrap_forward_keeps_underscores_in_alias() {
        let t = transcoder();
        let wrapped = t.wrap_forward("client@client.tld", "help_desk").unwrap();
        assert_eq!(
            t.unwrap_forward(&wrapped).unwrap(),
            ("client@client.tld".to_string(), "help_desk".to_string())
        );
    }

    #[test]
    fn unwrap_forward_requires_alias_suffix() {
        let t = transcoder();
        assert_eq!(
            t.unwrap_forward("client_at_client.tld@proxy.tld"),
            Err(AddressError::MissingAlias)
        );
        assert_eq!(
            t.unwrap_forward("client_at_client.tld_@proxy.tld"),
            Err(AddressError::MissingAlias)
        );
    }

    #[test]
    fn decode_recognises_both_forms() {
        let t = transcoder();
        assert_eq!(
            t.decode("client_at_client.tld@proxy.tld").unwrap(),
            SyntheticAddress::Simple {
                target: "client@client.tld".into()
            }
        );
        let forward = t.decode("client_at_client.tld_support@proxy.tld").unwrap();
        assert_eq!(forward.target(), "client@client.tld");
        assert_eq!(forward.alias(), Some("support"));
        assert_eq!(t.encode(&forward).unwrap(), "client_at_client.tld_support@proxy.tld");
    }

    #[test]
    fn decode_fails_closed_on_garbage() {
        let t = transcoder();
        assert!(t.decode("").is_err());
        assert!(t.decode("@proxy.tld").is_err());
        assert!(t.decode("a_at_b_at_@proxy.tld").is_err());
        assert!(t.decode("plain@proxy.tld").is_err());
    }

    #[test]
    fn forwarding_flag_selects_form() {
        assert_eq!(AddressForm::for_forwarding(true), AddressForm::ForwardCapable);
        assert_eq!(AddressForm::for_forwarding(false), AddressForm::Simple);
    }

    // ── Properties ──────────────────────────────────────────────────

    fn local_part() -> impl Strategy<Value = String> {
        "[a-z0-9](?:[a-z0-9+_-]{0,14}[a-z0-9])?(?:\\.[a-z0-9]{1,8}){0,2}"
    }

    fn domain() -> impl Strategy<Value = String> {
        "[a-z0-9](?:[a-z0-9-]{0,10}[a-z0-9])?(?:\\.[a-z0-9](?:[a-z0-9-]{0,10}[a-z0-9])?){0,2}\\.[a-z]{2,6}"
    }

    fn alias() -> impl Strategy<Value = String> {
        "[a-z0-9](?:[a-z0-9_-]{0,10}[a-z0-9])?"
    }

    proptest! {
        #[test]
        fn unwrap_inverts_wrap(local in local_part(), domain in domain()) {
            prop_assume!(domain != "proxy.tld");
            let t = transcoder();
            let address = format!("{local}@{domain}");
            let wrapped = t.wrap(&address).unwrap();
            prop_assert_eq!(t.unwrap(&wrapped).unwrap(), address);
        }

        #[test]
        fn unwrap_forward_inverts_wrap_forward(
            local in local_part(),
            domain in domain(),
            alias in alias(),
        ) {
            prop_assume!(domain != "proxy.tld");
            prop_assume!(!format!("_{alias}").contains(WRAP_MARKER));
            let t = transcoder();
            let address = format!("{local}@{domain}");
            let wrapped = t.wrap_forward(&address, &alias).unwrap();
            prop_assert_eq!(t.unwrap_forward(&wrapped).unwrap(), (address, alias));
        }

        #[test]
        fn underscored_decoded_domains_never_unwrap(
            local in local_part(),
            left in "[a-z0-9]{1,8}",
            right in "[a-z0-9]{1,8}",
        ) {
            let t = transcoder();
            let synthetic = format!("{local}_at_{left}_{right}.tld@proxy.tld");
            prop_assert_eq!(t.unwrap(&synthetic), Err(AddressError::NestedDomain));
        }

        #[test]
        fn hyphenated_domains_round_trip(
            local in local_part(),
            label in "[a-z0-9]{1,6}-[a-z0-9]{1,6}",
        ) {
            let t = transcoder();
            let address = format!("{local}@{label}.example");
            let wrapped = t.wrap(&address).unwrap();
            prop_assert_eq!(t.unwrap(&wrapped).unwrap(), address);
        }

        #[test]
        fn transcoder_never_panics(input in ".{0,64}") {
            let t = transcoder();
            let _ = t.wrap(&input);
            let _ = t.unwrap(&input);
            let _ = t.unwrap_forward(&input);
            let _ = t.decode(&input);
        }
    }
}
