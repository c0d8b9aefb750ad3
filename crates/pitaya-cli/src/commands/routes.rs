//! `pitaya routes` — Show server identity and registered handlers.

use std::sync::Arc;

use pitaya_core::{ChannelDelivery, PitayaConfig, RpcType};

use super::{init_dispatcher, print_json};

pub fn run(config: &PitayaConfig) -> Result<(), String> {
    print_json(&describe(config)?);
    Ok(())
}

pub fn describe(config: &PitayaConfig) -> Result<serde_json::Value, String> {
    let (delivery, _rx) = ChannelDelivery::channel();
    let dispatcher = init_dispatcher(Arc::new(delivery))?;
    let registry = dispatcher.registry();

    Ok(serde_json::json!({
        "server": {
            "id": config.server.id,
            "kind": config.server.kind,
            "hostname": config.server.hostname,
            "frontend": config.server.frontend,
            "metadata": config.server.metadata,
        },
        "handlers": registry.names(RpcType::Sys),
        "remotes": registry.names(RpcType::User),
    }))
}
