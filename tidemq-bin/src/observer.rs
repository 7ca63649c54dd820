use async_trait::async_trait;

use tidemq::hook::{ObserveHook, Parameter, Type};
use tidemq::Result;

/// Logs connects, disconnects and every published message.
pub struct LogObserver;

impl LogObserver {
    pub const TYPES: [Type; 3] = [Type::ClientConnected, Type::ClientDisconnected, Type::MessagePublished];
}

#[async_trait]
impl ObserveHook for LogObserver {
    async fn notify(&self, param: &Parameter<'_>) -> Result<()> {
        match param {
            Parameter::ClientConnected(s) => {
                log::info!("{} connected, clean session: {}", s.id, s.clean_session);
            }
            Parameter::ClientDisconnected(s, reason) => {
                log::info!("{} disconnected, {}", s.id, reason);
            }
            Parameter::MessagePublished(from, p) => {
                log::info!(
                    "{} published to {}, qos: {}, retain: {}, {} bytes",
                    from,
                    p.topic,
                    p.qos.value(),
                    p.retain,
                    p.payload.len()
                );
            }
            _ => {}
        }
        Ok(())
    }
}
