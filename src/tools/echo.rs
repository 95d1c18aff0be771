use serde_json::{Map, Value, json};

pub const NAME: &str = "echo";

pub fn parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "text": {"type": "string", "description": "Text to return unchanged."}
        },
        "required": ["text"]
    })
}

pub fn run(args: &Map<String, Value>) -> anyhow::Result<Value> {
    let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
    Ok(json!({ "text": text }))
}
