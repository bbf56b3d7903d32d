//! Built-in handlers registered for every configured tenant.

use std::sync::Arc;

use wsgate_server::{ConnectionSession, HandlerRegistry, WebSocketHandler};

/// Replies with every message verbatim.
pub struct EchoHandler;

impl WebSocketHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    fn on_connect(&self, session: &Arc<ConnectionSession>) -> anyhow::Result<()> {
        session.on_message(|s| {
            if let Some(text) = s.recv() {
                s.send(text)?;
            }
            Ok(())
        });
        Ok(())
    }
}

/// Replies with `[tenant] user -> message`.
pub struct TaggedEchoHandler;

impl WebSocketHandler for TaggedEchoHandler {
    fn name(&self) -> &str {
        "tagged-echo"
    }

    fn on_connect(&self, session: &Arc<ConnectionSession>) -> anyhow::Result<()> {
        session.on_message(|s| {
            if let Some(text) = s.recv() {
                s.send(format!("[{}] {} -> {text}", s.tenant(), s.user()))?;
            }
            Ok(())
        });
        session.on_disconnect(|s| {
            tracing::debug!(user = %s.user(), "tagged-echo session ended");
            Ok(())
        });
        Ok(())
    }
}

/// Register the built-in handlers under each tenant.
pub fn register_builtin(registry: &HandlerRegistry, tenants: &[String]) {
    let echo: Arc<dyn WebSocketHandler> = Arc::new(EchoHandler);
    let tagged: Arc<dyn WebSocketHandler> = Arc::new(TaggedEchoHandler);
    for tenant in tenants {
        for handler in [&echo, &tagged] {
            let _ = registry.register(tenant, handler.name(), Arc::clone(handler));
        }
    }
    tracing::debug!(tenant_count = tenants.len(), "built-in handlers registered");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
