//! Gate hooks shipped with the broker.

use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::hook::{GateHook, Parameter, Verdict};
use crate::topic::Topic;
use crate::types::{HashMap, UserName};
use crate::Result;

/// Allows every connection, publish and subscription.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowHook;

#[async_trait]
impl GateHook for AllowHook {
    async fn check(&self, _param: &Parameter<'_>) -> Result<Verdict> {
        Ok(Verdict::Allow)
    }
}

/// One user of a [`LedgerHook`].
#[derive(Debug, Clone)]
pub struct LedgerUser {
    pub password: Bytes,
    pub publish: Vec<Topic>,
    pub subscribe: Vec<Topic>,
}

impl LedgerUser {
    /// A user allowed on everything matched by `filters`.
    pub fn new<P: Into<Bytes>>(password: P, filters: &[&str]) -> Result<Self> {
        let filters = filters.iter().map(|f| Topic::from_str(f)).collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { password: password.into(), publish: filters.clone(), subscribe: filters })
    }
}

/// A static table of users with the topics they may publish to and the
/// filters they may subscribe to.
///
/// Unknown users are denied, a wrong password answers bad credentials. A
/// publish is allowed when an allowed filter matches its topic, a
/// subscription when an allowed filter covers every topic the requested one
/// could match.
#[derive(Debug, Default, Clone)]
pub struct LedgerHook {
    users: HashMap<UserName, LedgerUser>,
}

impl LedgerHook {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn user<U: Into<UserName>>(mut self, username: U, user: LedgerUser) -> Self {
        self.users.insert(username.into(), user);
        self
    }
}

#[async_trait]
impl GateHook for LedgerHook {
    async fn check(&self, param: &Parameter<'_>) -> Result<Verdict> {
        let verdict = match param {
            Parameter::ClientAuthenticate(ci) => {
                match ci.username().and_then(|u| self.users.get(u)) {
                    None => Verdict::Deny,
                    Some(user) if ci.password() == Some(&user.password) => Verdict::Allow,
                    Some(_) => Verdict::BadCredentials,
                }
            }
            Parameter::MessagePublishCheckAcl(s, publish) => {
                let user = s.id.username.as_ref().and_then(|u| self.users.get(u));
                match user {
                    Some(user) if user.publish.iter().any(|f| f.matches_str(&publish.topic)) => Verdict::Allow,
                    _ => Verdict::Deny,
                }
            }
            Parameter::ClientSubscribeCheckAcl(s, subscribe) => {
                let user = s.id.username.as_ref().and_then(|u| self.users.get(u));
                let requested = Topic::from_str(&subscribe.topic_filter)?;
                match user {
                    Some(user) if user.subscribe.iter().any(|f| f.covers(&requested)) => Verdict::Allow,
                    _ => Verdict::Deny,
                }
            }
            _ => Verdict::Pass,
        };
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Connect, Publish, QoS};
    use crate::types::{ConnectInfo, Id, SessionInfo, Subscribe};

    fn ledger() -> LedgerHook {
        LedgerHook::new().user("alice", LedgerUser::new("secret", &["sensors/#", "alice/+"]).unwrap())
    }

    fn connect(user: &str, pass: &str) -> ConnectInfo {
        let c = Connect {
            username: Some(user.to_owned().into()),
            password: Some(Bytes::from(pass.to_owned())),
            ..Connect::default().client_id("c1")
        };
        ConnectInfo::new(Id::new(None, None, "c1".into(), Some(user.to_owned().into())), Box::new(c))
    }

    fn session(user: &str) -> SessionInfo {
        SessionInfo::new(Id::new(None, None, "c1".into(), Some(user.to_owned().into())), true, 0)
    }

    #[tokio::test]
    async fn authentication() {
        let l = ledger();
        assert_eq!(l.check(&Parameter::ClientAuthenticate(&connect("alice", "secret"))).await.unwrap(), Verdict::Allow);
        assert_eq!(
            l.check(&Parameter::ClientAuthenticate(&connect("alice", "nope"))).await.unwrap(),
            Verdict::BadCredentials
        );
        assert_eq!(l.check(&Parameter::ClientAuthenticate(&connect("bob", "secret"))).await.unwrap(), Verdict::Deny);
    }

    #[tokio::test]
    async fn acl() {
        let l = ledger();
        let s = session("alice");
        let ok = Publish::new("sensors/room1/temp", "1", QoS::AtMostOnce, false);
        let bad = Publish::new("restricted/x", "1", QoS::AtMostOnce, false);
        assert_eq!(l.check(&Parameter::MessagePublishCheckAcl(&s, &ok)).await.unwrap(), Verdict::Allow);
        assert_eq!(l.check(&Parameter::MessagePublishCheckAcl(&s, &bad)).await.unwrap(), Verdict::Deny);

        let sub = |f: &str| Subscribe::new(f.to_owned().into(), QoS::AtLeastOnce);
        assert_eq!(
            l.check(&Parameter::ClientSubscribeCheckAcl(&s, &sub("sensors/+/temp"))).await.unwrap(),
            Verdict::Allow
        );
        assert_eq!(l.check(&Parameter::ClientSubscribeCheckAcl(&s, &sub("alice/#"))).await.unwrap(), Verdict::Deny);
        assert_eq!(l.check(&Parameter::ClientSubscribeCheckAcl(&s, &sub("restricted/#"))).await.unwrap(), Verdict::Deny);

        let stranger = session("mallory");
        assert_eq!(l.check(&Parameter::MessagePublishCheckAcl(&stranger, &ok)).await.unwrap(), Verdict::Deny);
        assert_eq!(l.check(&Parameter::SessionCreated(&s)).await.unwrap(), Verdict::Pass);
    }

    #[tokio::test]
    async fn allow_everything() {
        let s = session("anyone");
        let p = Publish::new("x", "1", QoS::AtMostOnce, false);
        assert_eq!(AllowHook.check(&Parameter::MessagePublishCheckAcl(&s, &p)).await.unwrap(), Verdict::Allow);
    }
}
