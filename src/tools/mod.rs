//! 工具层：注册表、调用器、内置记忆工具与用户工具沙箱

pub mod base;
pub mod invoker;
pub mod registry;
pub mod sandbox;
pub mod schema;

pub use base::{register_base_tools, BASE_TOOLS};
pub use invoker::{
    parse_arguments, take_heartbeat, ToolInvocation, ToolInvoker, ToolOutcome, ToolStatus,
};
pub use registry::{validate_tool_name, RegisteredTool, Tool, ToolContext, ToolRegistry};
pub use sandbox::{
    create_sandbox_from_config, derive_schema_from_signature, DisabledSandbox, ProcessSandbox,
    SandboxOutput, SandboxedTool, ToolSandbox,
};
pub use schema::{schema_value, tool_call_schema_json};
