//! Plugins shipped with the server.

pub mod command;
pub mod example;
pub mod receive_info;
pub mod topics;

use std::sync::Arc;

use super::source::Catalog;
use command::CommandPlugin;
use example::ExamplePlugin;
use receive_info::ReceiveInfoPlugin;
use topics::TopicsPlugin;

/// Every built-in unit, keyed by the name plugin manifests refer to.
pub fn catalog() -> Catalog {
    Catalog::new()
        .with(ReceiveInfoPlugin::UNIT, || Arc::new(ReceiveInfoPlugin::new()))
        .with(ExamplePlugin::UNIT, || Arc::new(ExamplePlugin::new()))
        .with(CommandPlugin::UNIT, || Arc::new(CommandPlugin::new()))
        .with(TopicsPlugin::UNIT, || Arc::new(TopicsPlugin::new()))
}
