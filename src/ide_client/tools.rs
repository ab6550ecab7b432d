//! Tool façade — named editor operations over `tools/call`.
//!
//! Every wrapper only shapes arguments and passes the unwrapped payload
//! through; none adds RPCs or retries.

use serde::Serialize;
use serde_json::{json, Map, Value};

use super::client::IdeClient;
use super::errors::IdeError;

/// Method carrying every named tool invocation.
pub const TOOLS_CALL_METHOD: &str = "tools/call";

/// Method listing the peer's tools.
pub const TOOLS_LIST_METHOD: &str = "tools/list";

/// Optional arguments for [`IdeClient::open_file`].
///
/// `start_text`/`end_text` select the range between the first occurrences of
/// each; empty strings select nothing. Unset flags are omitted from the call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenFileOptions {
    pub start_text: String,
    pub end_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select_to_end_of_line: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub make_frontmost: Option<bool>,
}

/// Arguments for [`IdeClient::open_diff`]. Field names are sent as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenDiffRequest {
    pub old_file_path: String,
    pub new_file_path: String,
    pub new_file_contents: String,
    pub tab_name: String,
}

/// Normalize the `result` of a `tools/call` reply.
///
/// The payload passes through unchanged; an absent or null result becomes
/// an empty object.
pub fn unwrap_tool_result(result: Value) -> Value {
    match result {
        Value::Null => Value::Object(Map::new()),
        payload => payload,
    }
}

fn to_arguments(args: &impl Serialize) -> Result<Value, IdeError> {
    serde_json::to_value(args).map_err(|e| IdeError::TransportError {
        reason: format!("failed to serialize tool arguments: {e}"),
    })
}

fn open_file_arguments(file_path: &str, options: &OpenFileOptions) -> Result<Value, IdeError> {
    let mut args = to_arguments(options)?;
    if let Value::Object(fields) = &mut args {
        fields.insert("filePath".into(), Value::String(file_path.to_string()));
    }
    Ok(args)
}

fn diagnostics_arguments(uri: Option<&str>) -> Value {
    match uri {
        Some(uri) if !uri.is_empty() => json!({ "uri": uri }),
        _ => json!({}),
    }
}

impl IdeClient {
    /// Invoke the named tool with `arguments` and return the reply's `result`.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, IdeError> {
        tracing::debug!(tool = name, "invoking tool");
        let result = self
            .call(TOOLS_CALL_METHOD, json!({ "name": name, "arguments": arguments }))
            .await?;
        Ok(unwrap_tool_result(result))
    }

    /// The raw `tools/list` result.
    pub async fn list_tools(&self) -> Result<Value, IdeError> {
        self.call(TOOLS_LIST_METHOD, json!({})).await
    }

    pub async fn get_workspace_folders(&self) -> Result<Value, IdeError> {
        self.invoke("getWorkspaceFolders", json!({})).await
    }

    pub async fn get_open_editors(&self) -> Result<Value, IdeError> {
        self.invoke("getOpenEditors", json!({})).await
    }

    /// Open `file_path` in the editor: `{filePath, startText, endText, preview?,
    /// selectToEndOfLine?, makeFrontmost?}`.
    pub async fn open_file(
        &self,
        file_path: &str,
        options: &OpenFileOptions,
    ) -> Result<Value, IdeError> {
        self.invoke("openFile", open_file_arguments(file_path, options)?)
            .await
    }

    /// [`open_file`](Self::open_file) selecting from `start_text` to `end_text`.
    pub async fn open_file_with_selection(
        &self,
        file_path: &str,
        start_text: &str,
        end_text: &str,
    ) -> Result<Value, IdeError> {
        let options = OpenFileOptions {
            start_text: start_text.to_string(),
            end_text: end_text.to_string(),
            ..OpenFileOptions::default()
        };
        self.open_file(file_path, &options).await
    }

    pub async fn get_current_selection(&self) -> Result<Value, IdeError> {
        self.invoke("getCurrentSelection", json!({})).await
    }

    pub async fn get_latest_selection(&self) -> Result<Value, IdeError> {
        self.invoke("getLatestSelection", json!({})).await
    }

    /// `{filePath}`
    pub async fn save_document(&self, file_path: &str) -> Result<Value, IdeError> {
        self.invoke("saveDocument", json!({ "filePath": file_path }))
            .await
    }

    /// `{filePath}`
    pub async fn check_document_dirty(&self, file_path: &str) -> Result<Value, IdeError> {
        self.invoke("checkDocumentDirty", json!({ "filePath": file_path }))
            .await
    }

    /// Diagnostics for `uri`, or for every open document when `None`.
    pub async fn get_diagnostics(&self, uri: Option<&str>) -> Result<Value, IdeError> {
        self.invoke("getDiagnostics", diagnostics_arguments(uri))
            .await
    }

    pub async fn open_diff(&self, request: &OpenDiffRequest) -> Result<Value, IdeError> {
        self.invoke("openDiff", to_arguments(request)?).await
    }

    /// `{tab_name}`
    pub async fn close_tab(&self, tab_name: &str) -> Result<Value, IdeError> {
        self.invoke("close_tab", json!({ "tab_name": tab_name }))
            .await
    }

    pub async fn close_all_diff_tabs(&self) -> Result<Value, IdeError> {
        self.invoke("closeAllDiffTabs", json!({})).await
    }

    /// Run `code` in the editor's active kernel. `{code}`
    pub async fn execute_code(&self, code: &str) -> Result<Value, IdeError> {
        self.invoke("executeCode", json!({ "code": code })).await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
