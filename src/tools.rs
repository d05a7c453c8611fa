//! CRM tool surface exposed over `tools/list` and `tools/call`

use std::sync::{Arc, LazyLock};

use regex::Regex;
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::rpc_codes;
use crate::metadata::ODataModel;
use crate::protocol::{CallToolResult, Tool};
use crate::upstream::UpstreamClient;
use crate::{Error, Result};

static ENTITY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex")
});

static GUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("valid regex")
});

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadArgs {
    entity: String,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    select: Vec<String>,
    #[serde(default)]
    expand: Vec<String>,
    #[serde(default)]
    order_by: Option<String>,
    #[serde(default)]
    top: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DescribeArgs {
    entity_set: String,
}

#[derive(Debug, Deserialize)]
struct CreateArgs {
    entity: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct UpdateArgs {
    entity: String,
    id: String,
    data: Value,
}

#[derive(Debug, Deserialize)]
struct DeleteArgs {
    entity: String,
    id: String,
}

/// Percent-encode a query value (`%20` for spaces)
fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// OData key literal: numbers and GUIDs verbatim, everything else quoted
pub fn format_entity_key(id: &str) -> String {
    if (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())) || GUID.is_match(id) {
        return id.to_string();
    }
    format!("'{}'", id.replace('\'', "''"))
}

fn odata_query(args: &ReadArgs) -> String {
    let mut params = Vec::new();
    if let Some(filter) = args.filter.as_deref().filter(|f| !f.is_empty()) {
        params.push(format!("$filter={}", encode_component(filter)));
    }
    if !args.select.is_empty() {
        params.push(format!("$select={}", encode_component(&args.select.join(","))));
    }
    if !args.expand.is_empty() {
        params.push(format!("$expand={}", encode_component(&args.expand.join(","))));
    }
    if let Some(order_by) = args.order_by.as_deref().filter(|o| !o.is_empty()) {
        params.push(format!("$orderby={}", encode_component(order_by)));
    }
    if let Some(top) = args.top.filter(|t| *t > 0) {
        params.push(format!("$top={top}"));
    }
    if params.is_empty() {
        String::new()
    } else {
        format!("?{}", params.join("&"))
    }
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T> {
    serde_json::from_value(arguments)
        .map_err(|e| Error::json_rpc(rpc_codes::INVALID_PARAMS, format!("Invalid arguments: {e}")))
}

fn check_entity(entity: &str) -> Result<()> {
    if ENTITY_NAME.is_match(entity) {
        Ok(())
    } else {
        Err(Error::json_rpc(
            rpc_codes::INVALID_PARAMS,
            format!("Invalid entity name: {entity}"),
        ))
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// CRUD tools backed by the CRM OData API
pub struct CrmTools {
    upstream: Arc<UpstreamClient>,
    readonly: bool,
}

impl CrmTools {
    /// Create the tool set
    pub fn new(upstream: Arc<UpstreamClient>, readonly: bool) -> Self {
        Self { upstream, readonly }
    }

    /// Tool definitions; write tools are omitted in read-only mode
    pub fn list(&self) -> Vec<Tool> {
        let entity = json!({ "type": "string", "description": "OData entity set, e.g. Contact" });
        let id = json!({ "type": "string", "description": "Record key (GUID, number or string)" });
        let mut tools = vec![
            Tool {
                name: "crm_read".to_string(),
                description: Some("Read records from an entity set".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "entity": entity,
                        "filter": { "type": "string", "description": "OData $filter expression" },
                        "select": { "type": "array", "items": { "type": "string" } },
                        "expand": { "type": "array", "items": { "type": "string" } },
                        "orderBy": { "type": "string" },
                        "top": { "type": "integer", "minimum": 1 }
                    },
                    "required": ["entity"]
                }),
            },
            Tool {
                name: "crm_list_entities".to_string(),
                description: Some(
                    "List the OData entity sets; call before crm_describe_entity".to_string(),
                ),
                input_schema: json!({ "type": "object", "properties": {} }),
            },
            Tool {
                name: "crm_describe_entity".to_string(),
                description: Some(
                    "Key and typed properties of an entity set, from $metadata".to_string(),
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": { "entitySet": entity },
                    "required": ["entitySet"]
                }),
            },
            Tool {
                name: "crm_whoami".to_string(),
                description: Some("Describe the CRM user the gateway acts as".to_string()),
                input_schema: json!({ "type": "object", "properties": {} }),
            },
        ];
        if !self.readonly {
            tools.extend([
                Tool {
                    name: "crm_create".to_string(),
                    description: Some("Create a record".to_string()),
                    input_schema: json!({
                        "type": "object",
                        "properties": { "entity": entity, "data": { "type": "object" } },
                        "required": ["entity", "data"]
                    }),
                },
                Tool {
                    name: "crm_update".to_string(),
                    description: Some("Update a record".to_string()),
                    input_schema: json!({
                        "type": "object",
                        "properties": { "entity": entity, "id": id, "data": { "type": "object" } },
                        "required": ["entity", "id", "data"]
                    }),
                },
                Tool {
                    name: "crm_delete".to_string(),
                    description: Some("Delete a record".to_string()),
                    input_schema: json!({
                        "type": "object",
                        "properties": { "entity": entity, "id": id },
                        "required": ["entity", "id"]
                    }),
                },
            ]);
        }
        tools
    }

    /// Run a tool.
    ///
    /// Unknown tools and malformed arguments are JSON-RPC errors. Upstream
    /// failures, including missing consent, become `isError` results so the
    /// agent can show them to the user.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let outcome = match name {
            "crm_read" => self.read(parse_args(arguments)?).await,
            "crm_list_entities" => self.list_entities().await,
            "crm_describe_entity" => self.describe_entity(parse_args(arguments)?).await,
            "crm_whoami" => self.whoami().await,
            "crm_create" | "crm_update" | "crm_delete" if self.readonly => {
                return Ok(CallToolResult::error(format!(
                    "{name} is disabled: the gateway runs in read-only mode"
                )));
            }
            "crm_create" => self.create(parse_args(arguments)?).await,
            "crm_update" => self.update(parse_args(arguments)?).await,
            "crm_delete" => self.delete(parse_args(arguments)?).await,
            _ => {
                return Err(Error::json_rpc(
                    rpc_codes::METHOD_NOT_FOUND,
                    format!("Unknown tool: {name}"),
                ));
            }
        };

        match outcome {
            Ok(text) => Ok(CallToolResult::text(text)),
            Err(e @ Error::JsonRpc { .. }) => Err(e),
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool call failed");
                Ok(CallToolResult::error(e.to_string()))
            }
        }
    }

    async fn read(&self, args: ReadArgs) -> Result<String> {
        check_entity(&args.entity)?;
        let url = format!("{}{}", self.upstream.entity_url(&args.entity), odata_query(&args));
        let body = self.upstream.fetch_json(Method::GET, &url, None).await?;
        let value = match body {
            Value::Object(mut map) if map.contains_key("value") => {
                map.remove("value").unwrap_or(Value::Null)
            }
            other => other,
        };
        let count = value.as_array().map_or(usize::from(!value.is_null()), Vec::len);
        info!(entity = %args.entity, result_count = count, "CRM read");
        Ok(pretty(&value))
    }

    async fn create(&self, args: CreateArgs) -> Result<String> {
        check_entity(&args.entity)?;
        let url = self.upstream.entity_url(&args.entity);
        let created = self.upstream.fetch_json(Method::POST, &url, Some(&args.data)).await?;
        info!(entity = %args.entity, "CRM record created");
        Ok(pretty(&created))
    }

    async fn update(&self, args: UpdateArgs) -> Result<String> {
        check_entity(&args.entity)?;
        let url = format!(
            "{}({})",
            self.upstream.entity_url(&args.entity),
            format_entity_key(&args.id)
        );
        self.upstream.fetch_text(Method::PATCH, &url, Some(&args.data)).await?;
        info!(entity = %args.entity, id = %args.id, "CRM record updated");
        Ok(format!("Updated {}({})", args.entity, args.id))
    }

    async fn delete(&self, args: DeleteArgs) -> Result<String> {
        check_entity(&args.entity)?;
        let url = format!(
            "{}({})",
            self.upstream.entity_url(&args.entity),
            format_entity_key(&args.id)
        );
        self.upstream.fetch_text(Method::DELETE, &url, None).await?;
        info!(entity = %args.entity, id = %args.id, "CRM record deleted");
        Ok(format!("Deleted {}({})", args.entity, args.id))
    }

    /// Entity sets from the service document, or from `$metadata` when the
    /// service document is unavailable
    async fn list_entities(&self) -> Result<String> {
        let url = format!("{}/", self.upstream.odata_root());
        let from_service = match self.upstream.fetch_json(Method::GET, &url, None).await {
            Ok(body) => body["value"].as_array().map(|sets| {
                sets.iter()
                    .filter_map(|set| set["name"].as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            }),
            Err(e @ (Error::Upstream { .. } | Error::Json(_))) => {
                warn!(url = %url, error = %e, "Service document unavailable, using $metadata");
                None
            }
            Err(e) => return Err(e),
        };
        let sets = match from_service {
            Some(sets) => sets,
            None => self.metadata().await?.entity_set_names(),
        };
        info!(result_count = sets.len(), "CRM entity sets listed");
        Ok(json!({ "results": sets }).to_string())
    }

    async fn describe_entity(&self, args: DescribeArgs) -> Result<String> {
        check_entity(&args.entity_set)?;
        let description = self.metadata().await?.describe(&args.entity_set)?;
        info!(
            entity = %args.entity_set,
            property_count = description.properties.len(),
            "CRM entity described"
        );
        Ok(serde_json::to_string(&description)?)
    }

    /// Fetched on every call, under the current user's credentials
    async fn metadata(&self) -> Result<ODataModel> {
        let xml = self.upstream.fetch_xml(&self.upstream.metadata_url()).await?;
        ODataModel::parse(&xml)
    }

    async fn whoami(&self) -> Result<String> {
        let url = self.upstream.user_info_url();
        let info = self.upstream.fetch_json(Method::POST, &url, Some(&json!({}))).await?;
        Ok(pretty(&info))
    }
}
