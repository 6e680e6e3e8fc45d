//! Per-bridge tools forwarding to a [`ProtocolClient`] peer.

use std::io::{BufRead, Write};

use anyhow::Result;
use serde_json::{Value, json};

use crate::core::types::ToolSpec;
use crate::io::protocol::ProtocolClient;
use crate::tools::{SessionState, ToolHandler, str_arg};

pub struct BridgeListTools<'a, W, R> {
    pub client: &'a ProtocolClient<W, R>,
}

impl<W: Write, R: BufRead> ToolHandler for BridgeListTools<'_, W, R> {
    fn spec(&self) -> ToolSpec {
        let name = self.client.name();
        ToolSpec::new(
            format!("bridge_{name}_list_tools"),
            format!("List the tools offered by the {name} bridge."),
            json!({ "type": "object", "properties": {} }),
        )
    }

    fn call(&self, _args: &Value, _state: &mut SessionState) -> Result<Value> {
        let tools = self.client.list_tools()?;
        Ok(json!({ "tools": tools }))
    }
}

pub struct BridgeCall<'a, W, R> {
    pub client: &'a ProtocolClient<W, R>,
}

impl<W: Write, R: BufRead> ToolHandler for BridgeCall<'_, W, R> {
    fn spec(&self) -> ToolSpec {
        let name = self.client.name();
        ToolSpec::new(
            format!("bridge_{name}_call"),
            format!("Call a tool on the {name} bridge."),
            json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "minLength": 1 },
                    "arguments": { "type": "object" }
                },
                "required": ["name"]
            }),
        )
    }

    fn call(&self, args: &Value, _state: &mut SessionState) -> Result<Value> {
        let tool = str_arg(args, "name")?;
        let arguments = args.get("arguments").cloned().unwrap_or_else(|| json!({}));
        let result = self.client.call_tool(tool, arguments)?;
        Ok(json!({ "result": result }))
    }
}
