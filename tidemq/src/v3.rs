//! MQTT connection handling: the CONNECT handshake, client id takeover and
//! the hand-off to the session task. MQTT 5 clients go through the same
//! steps with 3.1.1 session semantics.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::codec::{ConnectAckReason, DecodeError};
use crate::context::ServerContext;
use crate::hook::Verdict;
use crate::net::{MqttError, MqttStream};
use crate::session::SessionState;
use crate::types::{ConnectInfo, Id, Message, OfflineState, SessionEntry, SessionInfo};
use crate::utils::timestamp_millis;
use crate::Result;

const KICK_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves one accepted connection until it ends.
pub async fn process<Io>(scx: ServerContext, mut sink: MqttStream<Io>) -> Result<()>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let mut connect = match sink.recv_connect(sink.cfg.handshake_timeout).await {
        Ok(connect) => connect,
        Err(e) => {
            if let Some(MqttError::Decode(DecodeError::UnsupportedProtocolLevel)) = e.downcast_ref::<MqttError>() {
                refuse(&mut sink, ConnectAckReason::UnacceptableProtocolVersion).await;
            }
            return Err(e);
        }
    };

    if scx.lifecycle.is_draining() {
        refuse(&mut sink, ConnectAckReason::ServiceUnavailable).await;
        return Err(MqttError::Draining.into());
    }

    if connect.client_id.is_empty() {
        if !connect.clean_session {
            refuse(&mut sink, ConnectAckReason::IdentifierRejected).await;
            return Err(MqttError::IdentifierRejected.into());
        }
        connect.client_id = uuid::Uuid::new_v4().simple().to_string().into();
    }
    if connect.client_id.len() > scx.settings.mqtt.max_clientid_len {
        refuse(&mut sink, ConnectAckReason::IdentifierRejected).await;
        return Err(MqttError::IdentifierRejected.into());
    }

    let id = Id::new(
        Some(sink.cfg.laddr),
        Some(sink.remote_addr),
        connect.client_id.clone(),
        connect.username.clone(),
    );
    let connect_info = ConnectInfo::new(id.clone(), connect);
    match scx.hooks.client_authenticate(&connect_info).await {
        Verdict::Allow => {}
        Verdict::BadCredentials => {
            refuse(&mut sink, ConnectAckReason::BadUserNameOrPassword).await;
            return Err(MqttError::BadUsernameOrPassword.into());
        }
        _ => {
            refuse(&mut sink, ConnectAckReason::NotAuthorized).await;
            return Err(MqttError::NotAuthorized.into());
        }
    }
    let connect = connect_info.connect;
    let client_id = connect.client_id.clone();
    let clean_session = connect.clean_session;

    let (tx, rx) = mpsc::unbounded_channel();
    let mut info = Arc::new(SessionInfo::new(id.clone(), clean_session, timestamp_millis()));
    let prev = scx.sessions.insert(client_id.clone(), SessionEntry { tx: tx.clone(), info: info.clone() });
    let offline = match prev {
        Some(prev) => kick(&id, prev, clean_session).await,
        None => None,
    };

    if let Some(state) = offline.as_ref() {
        info = Arc::new(SessionInfo::new(id.clone(), clean_session, state.created_at));
        if let Some(mut entry) = scx.sessions.get_mut(&client_id) {
            if entry.same_channel(&tx) {
                entry.info = info.clone();
            }
        }
    }

    let session_present = !clean_session && offline.is_some();
    let mut session = SessionState::new(scx.clone(), info.clone(), tx, rx, connect.keep_alive, connect.last_will);
    match offline {
        Some(state) => session.restore(state).await,
        None => scx.hooks.session_created(&info).await,
    }
    scx.hooks.client_connected(&info).await;

    log::debug!("{} connected, clean session: {}, session present: {}", id, clean_session, session_present);
    if let Err(e) = sink.send_connect_ack(ConnectAckReason::ConnectionAccepted, session_present).await {
        log::debug!("{} CONNACK failed, {:?}", id, e);
    }
    session.run(sink).await;
    Ok(())
}

/// Displaces the session registered before us under the same client id and
/// takes its state when it hands it over.
async fn kick(id: &Id, prev: SessionEntry, clean_session: bool) -> Option<OfflineState> {
    let (reply, rx) = oneshot::channel();
    if prev.tx.send(Message::Kick(reply, clean_session)).is_err() {
        return None;
    }
    log::debug!("{} kicking previous session {}", id, prev.info.id);
    match tokio::time::timeout(KICK_TIMEOUT, rx).await {
        Ok(Ok(state)) => state,
        Ok(Err(_)) => None,
        Err(_) => {
            log::warn!("{} previous session did not answer the kick", id);
            None
        }
    }
}

async fn refuse<Io>(sink: &mut MqttStream<Io>, reason: ConnectAckReason)
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    log::debug!("{} connection refused, {}", sink.remote_addr, reason.reason());
    if let Err(e) = sink.send_connect_ack(reason, false).await {
        log::debug!("{} CONNACK failed, {:?}", sink.remote_addr, e);
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::auth::{LedgerHook, LedgerUser};
    use crate::codec::{Connect, Packet};
    use crate::hook::Type;
    use crate::net::Builder;

    fn pair() -> (MqttStream<tokio::io::DuplexStream>, MqttStream<tokio::io::DuplexStream>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let cfg = Arc::new(Builder::new());
        (MqttStream::new(client, addr, cfg.clone()), MqttStream::new(server, addr, cfg))
    }

    async fn packet(client: &mut MqttStream<tokio::io::DuplexStream>) -> Option<Packet> {
        use futures::StreamExt;
        match tokio::time::timeout(Duration::from_secs(5), client.io.next()).await.unwrap() {
            Some(Ok((packet, _))) => Some(packet),
            Some(Err(e)) => panic!("decode error, {:?}", e),
            None => None,
        }
    }

    async fn connack(client: &mut MqttStream<tokio::io::DuplexStream>) -> (ConnectAckReason, bool) {
        match packet(client).await {
            Some(Packet::ConnectAck(ack)) => (ack.return_code, ack.session_present),
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn ledger(scx: &ServerContext) {
        let hook = LedgerHook::new().user("alice", LedgerUser::new("secret", &["#"]).unwrap());
        let register = scx.hooks.register();
        register.add_gate(&[Type::ClientAuthenticate], 0, Arc::new(hook)).await.unwrap();
        register.start().await;
    }

    #[tokio::test]
    async fn default_deny_without_auth_hook() {
        let scx = ServerContext::builder().build();
        let (mut client, server) = pair();
        let task = tokio::spawn(process(scx.clone(), server));
        client.send_connect(Connect::default().client_id("c1")).await.unwrap();
        assert_eq!(connack(&mut client).await, (ConnectAckReason::NotAuthorized, false));
        assert!(task.await.unwrap().is_err());
        assert!(scx.sessions.is_empty());
    }

    #[tokio::test]
    async fn bad_password_and_unknown_user() {
        let scx = ServerContext::builder().build();
        ledger(&scx).await;

        let (mut client, server) = pair();
        tokio::spawn(process(scx.clone(), server));
        let c = Connect { username: Some("alice".into()), password: Some("nope".into()), ..Default::default() };
        client.send_connect(c.client_id("c1")).await.unwrap();
        assert_eq!(connack(&mut client).await.0, ConnectAckReason::BadUserNameOrPassword);

        let (mut client, server) = pair();
        tokio::spawn(process(scx.clone(), server));
        let c = Connect { username: Some("mallory".into()), password: Some("x".into()), ..Default::default() };
        client.send_connect(c.client_id("c2")).await.unwrap();
        assert_eq!(connack(&mut client).await.0, ConnectAckReason::NotAuthorized);
    }

    #[tokio::test]
    async fn empty_client_id_needs_clean_session() {
        let scx = ServerContext::builder().build();
        ledger(&scx).await;
        let login = || Connect { username: Some("alice".into()), password: Some("secret".into()), ..Default::default() };

        let (mut client, server) = pair();
        tokio::spawn(process(scx.clone(), server));
        client.send_connect(Connect { clean_session: false, ..login() }).await.unwrap();
        assert_eq!(connack(&mut client).await.0, ConnectAckReason::IdentifierRejected);

        let (mut client, server) = pair();
        tokio::spawn(process(scx.clone(), server));
        client.send_connect(Connect { clean_session: true, ..login() }).await.unwrap();
        assert_eq!(connack(&mut client).await, (ConnectAckReason::ConnectionAccepted, false));
        client.send(Packet::PingRequest).await.unwrap();
        assert_eq!(packet(&mut client).await, Some(Packet::PingResponse));
        assert_eq!(scx.sessions.len(), 1);
    }

    #[tokio::test]
    async fn refused_while_draining() {
        let scx = ServerContext::builder().build();
        ledger(&scx).await;
        scx.drain().await;
        let (mut client, server) = pair();
        let task = tokio::spawn(process(scx.clone(), server));
        client.send_connect(Connect::default().client_id("late")).await.unwrap();
        assert_eq!(connack(&mut client).await.0, ConnectAckReason::ServiceUnavailable);
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err.downcast_ref::<MqttError>(), Some(MqttError::Draining)));
        assert_eq!(packet(&mut client).await, None);
    }
}
