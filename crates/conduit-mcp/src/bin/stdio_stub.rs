//! Minimal MCP server on stdio, used to exercise the process transport.
//!
//! Tools: `add`, `echo`, `whoami` (reports `API_TOKEN`), `sleep`, `fail`,
//! `touch_tools` (emits `notifications/tools/list_changed`), `malformed`,
//! `noisy` (writes undecodable lines before answering) and `crash` (exits
//! without answering). `tools/list` is split over pages of four.

use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::time::Duration;

const PAGE_SIZE: usize = 4;

fn tools() -> Vec<Value> {
    let number = json!({"type": "number"});
    vec![
        json!({"name": "add", "description": "Add two numbers",
               "inputSchema": {"type": "object", "properties": {"a": number, "b": number}, "required": ["a", "b"]}}),
        json!({"name": "echo", "description": "Echo a message",
               "inputSchema": {"type": "object", "properties": {"message": {"type": "string"}}}}),
        json!({"name": "whoami", "description": "Report the injected API token"}),
        json!({"name": "sleep", "description": "Sleep for ms milliseconds",
               "inputSchema": {"type": "object", "properties": {"ms": number}}}),
        json!({"name": "fail", "description": "Always reports an error"}),
        json!({"name": "touch_tools", "description": "Announce a tool list change"}),
        json!({"name": "malformed", "description": "Answer with an invalid response"}),
        json!({"name": "noisy", "description": "Write garbage to stdout, then answer"}),
        json!({"name": "crash", "description": "Exit without answering"}),
    ]
}

fn text(body: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": body.into()}]})
}

fn emit(out: &mut impl Write, message: &Value) -> io::Result<()> {
    writeln!(out, "{message}")?;
    out.flush()
}

fn call_tool(out: &mut impl Write, params: &Value) -> io::Result<Result<Value, (i64, String)>> {
    let name = params["name"].as_str().unwrap_or_default();
    let args = &params["arguments"];
    let result = match name {
        "add" => {
            let a = args["a"].as_f64().unwrap_or(0.0);
            let b = args["b"].as_f64().unwrap_or(0.0);
            let sum = a + b;
            if sum.fract() == 0.0 && sum.abs() < 1e15 {
                Ok(json!(sum as i64))
            } else {
                Ok(json!(sum))
            }
        }
        "echo" => Ok(text(args["message"].as_str().unwrap_or_default())),
        "whoami" => Ok(text(std::env::var("API_TOKEN").unwrap_or_default())),
        "sleep" => {
            let ms = args["ms"].as_u64().unwrap_or(100);
            std::thread::sleep(Duration::from_millis(ms));
            Ok(text(format!("slept {ms}ms")))
        }
        "fail" => Ok(json!({"content": [{"type": "text", "text": "tool failed on purpose"}], "isError": true})),
        "touch_tools" => {
            emit(out, &json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}))?;
            Ok(text("touched"))
        }
        "noisy" => {
            out.write_all(b"\xff\xfe stray log\n")?;
            out.write_all(b"{\"jsonrpc\":\n")?;
            out.flush()?;
            Ok(text("still here"))
        }
        "crash" => std::process::exit(3),
        other => Err((-32602, format!("Unknown tool: {other}"))),
    };
    Ok(result)
}

fn list_tools(params: &Value) -> Value {
    let all = tools();
    let start = match params["cursor"].as_str() {
        Some(cursor) => cursor.parse::<usize>().unwrap_or(all.len()),
        None => 0,
    };
    let end = (start + PAGE_SIZE).min(all.len());
    let page: Vec<Value> = all.get(start..end).map(<[Value]>::to_vec).unwrap_or_default();
    if end < all.len() {
        json!({"tools": page, "nextCursor": end.to_string()})
    } else {
        json!({"tools": page})
    }
}

fn main() -> io::Result<()> {
    eprintln!("conduit-stdio-stub starting");
    let stdin = io::stdin();
    let mut out = io::stdout().lock();
    // Log noise on stdout that clients must skip.
    writeln!(out, "stub ready")?;
    out.flush()?;

    for line in stdin.lock().lines() {
        let line = line?;
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            eprintln!("unparseable input: {line}");
            continue;
        };
        let Some(id) = message.get("id").cloned() else {
            // notification
            continue;
        };
        if message.get("method").is_none() {
            // response to a request we never send
            continue;
        }
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        let result = match message["method"].as_str().unwrap_or_default() {
            "initialize" => Ok(json!({
                "protocolVersion": params["protocolVersion"].as_str().unwrap_or("2025-03-26"),
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "conduit-stdio-stub", "version": env!("CARGO_PKG_VERSION")}
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(list_tools(&params)),
            "tools/call" => {
                if params["name"] == "malformed" {
                    emit(&mut out, &json!({"jsonrpc": "2.0", "id": id}))?;
                    continue;
                }
                call_tool(&mut out, &params)?
            }
            other => Err((-32601, format!("Method not found: {other}"))),
        };

        let response = match result {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, msg)) => json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": msg}}),
        };
        emit(&mut out, &response)?;
    }
    Ok(())
}
