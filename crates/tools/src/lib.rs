//! Model-invoked tools: a JSON-Schema-validated registry with bounded
//! execution, plus the gold-loan domain tools. Tool metadata (names,
//! descriptions, schemas, timeouts) is declared in `config/domain/
//! tools.yaml`; the code only binds implementations to declared names.

pub mod gold_loan;
pub mod integrations;
pub mod mcp;
pub mod registry;

pub use gold_loan::build_domain_tools;
pub use integrations::{
    Appointment, CalendarSink, IntegrationError, Lead, LeadSink, StubCalendarSink, StubLeadSink,
};
pub use mcp::{ContentBlock, Tool, ToolCall, ToolCatalog, ToolError, ToolResult, ToolSpec};
pub use registry::{ToolCallRecord, ToolRegistry};

impl From<ToolError> for dhwani_core::Error {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Validation(m) => dhwani_core::Error::Validation(m),
            ToolError::MalformedResult(m) => {
                dhwani_core::Error::Validation(format!("malformed tool result: {}", m))
            }
            ToolError::Timeout { tool, timeout_ms } => {
                dhwani_core::Error::timeout(format!("tool {}", tool), timeout_ms)
            }
            ToolError::NotFound(name) => {
                dhwani_core::Error::Validation(format!("unknown tool: {}", name))
            }
            ToolError::Execution(m) => dhwani_core::Error::inference("tool", m),
        }
    }
}
