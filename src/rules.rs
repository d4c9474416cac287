//! Rules evaluator: pure, fail-closed predicates gating what a channel may
//! learn, receive, or push (spec §4.1).
//!
//! Grounded on `policy/eval.rs`'s requirement-tree evaluation: predicates
//! are plain closures combined with boolean algebra rather than an
//! inheritance hierarchy (spec §9 design note).

use std::sync::Arc;

use crate::channel::ChannelKind;
use crate::identity::RepoIdentity;
use crate::wire::DocId;

#[derive(Debug, Clone)]
pub struct RuleCtx<'a> {
    pub channel_kind: ChannelKind,
    pub adapter_type: &'a str,
    pub peer_identity: Option<&'a RepoIdentity>,
    pub doc_id: &'a DocId,
    pub our_identity: &'a RepoIdentity,
}

/// A boxed predicate over a rule context. Implementations must not panic;
/// a panicking predicate is caught at the call site and treated as `false`.
pub type RuleFn = Arc<dyn Fn(&RuleCtx) -> bool + Send + Sync>;

fn always_true(_ctx: &RuleCtx) -> bool {
    true
}

fn and(a: RuleFn, b: RuleFn) -> RuleFn {
    Arc::new(move |ctx| a(ctx) && b(ctx))
}

fn or(a: RuleFn, b: RuleFn) -> RuleFn {
    Arc::new(move |ctx| a(ctx) || b(ctx))
}

fn not(a: RuleFn) -> RuleFn {
    Arc::new(move |ctx| !a(ctx))
}

/// Combinators over `RuleFn`, letting callers build predicates by boolean
/// algebra instead of writing one monolithic closure (spec §9, §4.1).
pub trait RuleFnExt {
    fn and(self, other: RuleFn) -> RuleFn;
    fn or(self, other: RuleFn) -> RuleFn;
    fn negate(self) -> RuleFn;
}

impl RuleFnExt for RuleFn {
    fn and(self, other: RuleFn) -> RuleFn {
        and(self, other)
    }
    fn or(self, other: RuleFn) -> RuleFn {
        or(self, other)
    }
    fn negate(self) -> RuleFn {
        not(self)
    }
}

/// The three predicates gating visibility, reveal, and receipt (spec §4.1).
/// All default to `always_true`. Evaluation never panics outward — see
/// [`Rules::visibility`] and friends, which catch a panicking predicate and
/// fail closed.
#[derive(Clone)]
pub struct Rules {
    visibility: RuleFn,
    can_reveal: RuleFn,
    can_receive: RuleFn,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            visibility: Arc::new(always_true),
            can_reveal: Arc::new(always_true),
            can_receive: Arc::new(always_true),
        }
    }
}

impl Rules {
    pub fn with_visibility(mut self, f: RuleFn) -> Self {
        self.visibility = f;
        self
    }

    pub fn with_can_reveal(mut self, f: RuleFn) -> Self {
        self.can_reveal = f;
        self
    }

    pub fn with_can_receive(mut self, f: RuleFn) -> Self {
        self.can_receive = f;
        self
    }

    fn eval(name: &'static str, f: &RuleFn, ctx: &RuleCtx) -> bool {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(ctx))) {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(rule = name, "rule predicate panicked, failing closed");
                false
            }
        }
    }

    /// Storage channels default to full visibility/reveal so local changes
    /// are always persisted, per spec §4.6, regardless of the configured
    /// predicates — storage is not subject to discretionary visibility.
    pub fn visibility(&self, ctx: &RuleCtx) -> bool {
        if ctx.channel_kind == ChannelKind::Storage {
            return true;
        }
        Self::eval("visibility", &self.visibility, ctx)
    }

    pub fn can_reveal(&self, ctx: &RuleCtx) -> bool {
        if ctx.channel_kind == ChannelKind::Storage {
            return true;
        }
        Self::eval("can_reveal", &self.can_reveal, ctx)
    }

    pub fn can_receive(&self, ctx: &RuleCtx) -> bool {
        Self::eval("can_receive", &self.can_receive, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerKind;

    fn ctx<'a>(kind: ChannelKind, doc_id: &'a DocId, me: &'a RepoIdentity) -> RuleCtx<'a> {
        RuleCtx {
            channel_kind: kind,
            adapter_type: "test",
            peer_identity: None,
            doc_id,
            our_identity: me,
        }
    }

    #[test]
    fn default_rules_allow_everything() {
        let rules = Rules::default();
        let me = RepoIdentity::new("1", "me", PeerKind::User);
        let doc = "d1".to_string();
        let c = ctx(ChannelKind::Network, &doc, &me);
        assert!(rules.visibility(&c));
        assert!(rules.can_reveal(&c));
        assert!(rules.can_receive(&c));
    }

    #[test]
    fn storage_channels_bypass_visibility_predicate() {
        let rules = Rules::default().with_visibility(Arc::new(|_| false));
        let me = RepoIdentity::new("1", "me", PeerKind::User);
        let doc = "d1".to_string();
        assert!(rules.visibility(&ctx(ChannelKind::Storage, &doc, &me)));
        assert!(!rules.visibility(&ctx(ChannelKind::Network, &doc, &me)));
    }

    #[test]
    fn panicking_predicate_fails_closed() {
        let rules = Rules::default().with_can_receive(Arc::new(|_| panic!("boom")));
        let me = RepoIdentity::new("1", "me", PeerKind::User);
        let doc = "d1".to_string();
        assert!(!rules.can_receive(&ctx(ChannelKind::Network, &doc, &me)));
    }

    #[test]
    fn combinators_compose_predicates() {
        let only_net: RuleFn = Arc::new(|ctx: &RuleCtx| ctx.channel_kind == ChannelKind::Network);
        let only_d1: RuleFn = Arc::new(|ctx: &RuleCtx| ctx.doc_id == "d1");
        let combined = only_net.and(only_d1);
        let me = RepoIdentity::new("1", "me", PeerKind::User);
        let d1 = "d1".to_string();
        let d2 = "d2".to_string();
        assert!(combined(&ctx(ChannelKind::Network, &d1, &me)));
        assert!(!combined(&ctx(ChannelKind::Network, &d2, &me)));
    }
}
