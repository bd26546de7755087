//! Bridge registry: tools imported from an external tool server.
//!
//! Bridged tools are not described by a local schema, so the parser accepts
//! either a `<params>{json}</params>` body or arbitrary child tags for them.

use crate::error::ToolError;
use crate::tool::ToolResult;
use async_trait::async_trait;
use std::collections::BTreeSet;

#[async_trait]
pub trait BridgeRegistry: Send + Sync {
    /// Names of every tool the bridge currently exposes.
    fn list_tool_names(&self) -> BTreeSet<String>;

    fn is_bridged_tool(&self, name: &str) -> bool {
        self.list_tool_names().contains(name)
    }

    /// Execute a bridged tool with a JSON object of parameters.
    async fn execute(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> std::result::Result<ToolResult, ToolError>;
}
