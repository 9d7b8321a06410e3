use serde_json::Value;
use taskgate_tools::{ToolContext, ToolRegistry};

use super::{load_environment, Credentials};

fn schema_function(schema: &Value) -> &Value {
    schema.get("function").unwrap_or(schema)
}

/// List all registered tools.
pub fn list() {
    let registry = ToolRegistry::with_defaults();
    let schemas = registry.get_tool_schemas();

    println!();
    println!("Registered tools ({} total)", schemas.len());
    println!();
    for schema in &schemas {
        let func = schema_function(schema);
        let name = func["name"].as_str().unwrap_or("");
        let desc = func["description"].as_str().unwrap_or("");
        let short_desc: String = desc.chars().take(60).collect();
        let ellipsis = if desc.chars().count() > 60 { "..." } else { "" };
        println!("  {:<26} {}{}", name, short_desc, ellipsis);
    }
    println!();
}

/// Show the parameter schema of one tool.
pub fn info(tool_name: &str) -> anyhow::Result<()> {
    let registry = ToolRegistry::with_defaults();
    let tool = registry
        .get(tool_name)
        .ok_or_else(|| anyhow::anyhow!("Unknown tool: {}", tool_name))?;
    let schema = tool.schema();

    println!();
    println!("{}", schema.name);
    println!("  {}", schema.description);
    println!();

    let required: Vec<&str> = schema.parameters["required"]
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    if let Some(props) = schema.parameters["properties"].as_object() {
        println!("  Parameters:");
        for (name, prop) in props {
            let ty = prop["type"].as_str().unwrap_or("any");
            let marker = if required.contains(&name.as_str()) { "*" } else { " " };
            let desc = prop["description"].as_str().unwrap_or("");
            println!("   {}{:<22} {:<8} {}", marker, name, ty, desc);
        }
        println!();
        println!("  * required");
    }
    Ok(())
}

/// Call a tool directly with a JSON parameter object.
pub async fn call(tool_name: &str, params_json: &str) -> anyhow::Result<()> {
    let params: Value = serde_json::from_str(params_json)
        .map_err(|e| anyhow::anyhow!("Invalid JSON parameters: {}", e))?;
    if !params.is_object() {
        anyhow::bail!("Tool parameters must be a JSON object");
    }

    let (config, paths) = load_environment()?;
    let credentials = Credentials::open(&paths)?;
    let ctx = ToolContext::new(config, paths).with_credentials(credentials.store());
    let registry = ToolRegistry::with_defaults();

    // `execute` consumes the context, so the store is free to close after.
    let result = registry.execute(tool_name, ctx, params).await;
    credentials.close();

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
