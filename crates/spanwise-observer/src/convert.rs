//! Conversion of host payloads into span fields.

use crate::context::{Content, Event, LlmRequest, Part, ToolDeclaration, UsageMetadata};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};
use spanwise_core::{serialize_to_str, stringify_value, Message, MessageRole, ToolCall};
use spanwise_monitor::{Document, TokenUsage};
use std::collections::BTreeMap;

/// Converts host contents into chat messages, one per part, in order.
pub fn contents_to_messages(contents: &[Content]) -> Vec<Message> {
    contents.iter().flat_map(content_to_messages).collect()
}

pub fn content_to_messages(content: &Content) -> Vec<Message> {
    let role = MessageRole::from_host(content.role.as_deref().unwrap_or("user"));
    content.parts.iter().map(|part| part_to_message(part, role)).collect()
}

fn part_to_message(part: &Part, role: MessageRole) -> Message {
    match part {
        Part::Text(text) => Message::new(role, text.clone()),
        Part::InlineData { mime_type, data } => Message::new(
            role,
            json!({
                "type": "inline_data",
                "mime_type": mime_type,
                "data": STANDARD.encode(data),
            })
            .to_string(),
        ),
        Part::FileData { file_uri, mime_type } => {
            let mut body = Map::new();
            body.insert("type".into(), json!("file_data"));
            body.insert("file_uri".into(), json!(file_uri));
            if let Some(mime) = mime_type {
                body.insert("mime_type".into(), json!(mime));
            }
            Message::new(role, Value::Object(body).to_string())
        }
        Part::FunctionCall { id, name, args } => Message::tool(
            json!({ "type": "function_call", "id": id, "name": name, "args": args }).to_string(),
        ),
        Part::FunctionResponse { id, name, response } => Message::tool(
            json!({ "type": "function_response", "id": id, "name": name, "response": response })
                .to_string(),
        ),
    }
}

/// Messages recorded as the input of an LLM span.
pub fn request_messages(request: &LlmRequest) -> Vec<Message> {
    let mut messages = Vec::with_capacity(request.contents.len() + 1);
    if let Some(system) = request.system_instruction.as_deref().filter(|s| !s.is_empty()) {
        messages.push(Message::system(system));
    }
    messages.extend(contents_to_messages(&request.contents));
    messages
}

/// Assistant message and requested tool calls from a model response.
pub fn response_output(content: Option<&Content>) -> (Message, Vec<ToolCall>) {
    let Some(content) = content else {
        return (Message::assistant(""), Vec::new());
    };
    let tool_calls = content
        .parts
        .iter()
        .filter_map(|part| match part {
            Part::FunctionCall { id, name, args } => Some(ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: args.to_string(),
            }),
            _ => None,
        })
        .collect();
    (Message::assistant(content.text()), tool_calls)
}

/// Normalises tool declarations to function schemas.
pub fn normalize_tools(tools: &[ToolDeclaration]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description.clone().unwrap_or_default(),
                    "parameters": tool.parameters.clone().unwrap_or_else(|| json!({})),
                }
            })
        })
        .collect()
}

/// Token usage; absent counts are zero and a missing total is the sum.
pub fn usage(metadata: Option<&UsageMetadata>) -> TokenUsage {
    let Some(m) = metadata else {
        return TokenUsage::default();
    };
    let input_tokens = m.prompt_token_count.unwrap_or(0);
    let output_tokens = m.candidates_token_count.unwrap_or(0);
    TokenUsage {
        input_tokens,
        output_tokens,
        total_tokens: m.total_token_count.unwrap_or(input_tokens + output_tokens),
        reasoning_tokens: m.thoughts_token_count.unwrap_or(0),
        cached_tokens: m.cached_content_token_count.unwrap_or(0),
    }
}

/// Text of the first event flagged as the final response, else the text of
/// the last event that has any.
pub fn final_output(events: &[Event]) -> Option<String> {
    let text = |e: &Event| e.content.as_ref().map(Content::text).filter(|t| !t.is_empty());
    events
        .iter()
        .filter(|e| e.is_final_response)
        .find_map(text)
        .or_else(|| events.iter().rev().find_map(text))
}

pub fn stringify_metadata(metadata: &BTreeMap<String, Value>) -> BTreeMap<String, String> {
    metadata
        .iter()
        .map(|(k, v)| (k.clone(), stringify_value(v)))
        .collect()
}

/// Retriever span input: the `query` argument if present, else all args.
pub fn retriever_query(args: &Value) -> String {
    match args.get("query") {
        Some(query) => serialize_to_str(query),
        None => serialize_to_str(args),
    }
}

/// Documents from a retriever tool result.
pub fn documents(result: &Value) -> Vec<Document> {
    match result {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().map(document).collect(),
        Value::Object(map) => match map.get("documents").or_else(|| map.get("results")) {
            Some(Value::Array(items)) => items.iter().map(document).collect(),
            _ => vec![document(result)],
        },
        other => vec![Document::new(serialize_to_str(other))],
    }
}

fn document(item: &Value) -> Document {
    let Value::Object(map) = item else {
        return Document::new(serialize_to_str(item));
    };
    let content = ["content", "page_content", "text"]
        .iter()
        .find_map(|k| map.get(*k))
        .map(serialize_to_str)
        .unwrap_or_else(|| item.to_string());
    let metadata = match map.get("metadata") {
        Some(Value::Object(meta)) => meta
            .iter()
            .map(|(k, v)| (k.clone(), stringify_value(v)))
            .collect(),
        _ => BTreeMap::new(),
    };
    Document { content, metadata }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parts_to_messages_in_order() {
        let content = Content {
            role: Some("model".into()),
            parts: vec![
                Part::Text("look".into()),
                Part::InlineData {
                    mime_type: "image/png".into(),
                    data: vec![1, 2, 3],
                },
                Part::FunctionCall {
                    id: Some("c1".into()),
                    name: "calc".into(),
                    args: json!({"x": 1}),
                },
            ],
        };
        let messages = content_to_messages(&content);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], Message::assistant("look"));

        let inline: Value = serde_json::from_str(&messages[1].content).unwrap();
        assert_eq!(inline["type"], "inline_data");
        assert_eq!(inline["data"], "AQID");

        assert_eq!(messages[2].role, MessageRole::Tool);
        let call: Value = serde_json::from_str(&messages[2].content).unwrap();
        assert_eq!(call["name"], "calc");
    }

    #[test]
    fn test_file_data_without_mime() {
        let content = Content {
            role: None,
            parts: vec![Part::FileData {
                file_uri: "gs://b/doc.pdf".into(),
                mime_type: None,
            }],
        };
        let messages = content_to_messages(&content);
        assert_eq!(messages[0].role, MessageRole::User);
        let body: Value = serde_json::from_str(&messages[0].content).unwrap();
        assert!(body.get("mime_type").is_none());
    }

    #[test]
    fn test_system_instruction_first() {
        let request = LlmRequest {
            system_instruction: Some("be brief".into()),
            contents: vec![Content::user_text("hi")],
            ..Default::default()
        };
        let messages = request_messages(&request);
        assert_eq!(messages[0], Message::system("be brief"));
        assert_eq!(messages[1], Message::user("hi"));
    }

    #[test]
    fn test_response_output_with_tool_calls() {
        let content = Content {
            role: Some("model".into()),
            parts: vec![
                Part::Text("calling".into()),
                Part::FunctionCall {
                    id: None,
                    name: "calc".into(),
                    args: json!({"x": 1}),
                },
            ],
        };
        let (message, calls) = response_output(Some(&content));
        assert_eq!(message.content, "calling");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, r#"{"x":1}"#);
    }

    #[test]
    fn test_normalize_tools() {
        let tools = normalize_tools(&[ToolDeclaration {
            name: "calc".into(),
            description: None,
            parameters: None,
        }]);
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "calc");
        assert_eq!(tools[0]["function"]["parameters"], json!({}));
    }

    #[test]
    fn test_usage_defaults() {
        assert_eq!(usage(None), TokenUsage::default());
        let u = usage(Some(&UsageMetadata {
            prompt_token_count: Some(10),
            candidates_token_count: Some(2),
            ..Default::default()
        }));
        assert_eq!(u.total_tokens, 12);
    }

    #[test]
    fn test_final_output_prefers_first_final_event() {
        let events = vec![
            Event {
                content: Some(Content::model_text("thinking")),
                ..Default::default()
            },
            Event {
                content: Some(Content::model_text("4")),
                is_final_response: true,
                ..Default::default()
            },
            Event {
                content: Some(Content::model_text("tool noise")),
                ..Default::default()
            },
        ];
        assert_eq!(final_output(&events).as_deref(), Some("4"));
        assert_eq!(final_output(&events[2..]).as_deref(), Some("tool noise"));
        assert_eq!(final_output(&[]), None);
    }

    #[test]
    fn test_retriever_query() {
        assert_eq!(retriever_query(&json!({"query": "rust", "k": 3})), "rust");
        assert_eq!(retriever_query(&json!({"k": 3})), r#"{"k":3}"#);
    }

    #[test]
    fn test_documents() {
        let docs = documents(&json!([
            "plain",
            {"page_content": "doc", "metadata": {"source": "a.md", "page": 2}}
        ]));
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].content, "plain");
        assert_eq!(docs[1].content, "doc");
        assert_eq!(docs[1].metadata["page"], "2");

        assert_eq!(documents(&json!({"content": "one"}))[0].content, "one");
        assert_eq!(documents(&json!(42))[0].content, "42");
        assert!(documents(&Value::Null).is_empty());
    }
}
