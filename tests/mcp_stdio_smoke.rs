use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

/// Drives `contextloom start --mode mcp` over stdio against a config with no
/// repositories configured, so the smoke test never touches the network or
/// the embedding model — only the dispatch surface itself.
#[test]
fn mcp_stdio_smoke() {
    // `cargo test` sets this for integration tests.
    let bin = env!("CARGO_BIN_EXE_contextloom");

    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("config.json");
    std::fs::write(
        &config_path,
        serde_json::json!({
            "project": {"name": "smoke-test"},
            "repositories": []
        })
        .to_string(),
    )
    .expect("write config");

    let mut child = Command::new(bin)
        .arg("--config")
        .arg(&config_path)
        .arg("start")
        .arg("--mode")
        .arg("mcp")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn contextloom start --mode mcp");

    {
        let stdin = child.stdin.as_mut().expect("child stdin");

        // Keep each JSON-RPC message on one line (server reads by lines()).
        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": { "protocolVersion": "2024-11-05" }
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/list"
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {
                    "name": "get_repository_status",
                    "arguments": {}
                }
            })
        )
        .unwrap();

        writeln!(
            stdin,
            "{}",
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "prompts/get",
                "params": {
                    "name": "explain_code",
                    "arguments": { "subject": "the Scheduler type" }
                }
            })
        )
        .unwrap();
    }

    // Close stdin so the server loop can exit.
    drop(child.stdin.take());

    let stdout = child.stdout.take().expect("child stdout");
    let reader = BufReader::new(stdout);

    let mut replies_by_id: HashMap<i64, serde_json::Value> = HashMap::new();

    for line in reader.lines() {
        let line = line.expect("read stdout line");
        if line.trim().is_empty() {
            continue;
        }
        let v: serde_json::Value = serde_json::from_str(&line).expect("stdout is json");
        let id = v.get("id").and_then(|x| x.as_i64()).expect("json-rpc response id");
        replies_by_id.insert(id, v);
        if replies_by_id.len() >= 4 {
            break;
        }
    }

    let status = child.wait().expect("wait child");
    assert!(status.success(), "mcp process should exit cleanly");

    // initialize
    {
        let v = replies_by_id.get(&1).expect("initialize reply");
        assert_eq!(v.get("jsonrpc").and_then(|x| x.as_str()), Some("2.0"));
        let result = v.get("result").expect("initialize result");
        assert!(result.get("capabilities").is_some());
        assert_eq!(
            result.get("protocolVersion").and_then(|x| x.as_str()),
            Some("2024-11-05")
        );
    }

    // tools/list
    {
        let v = replies_by_id.get(&2).expect("tools/list reply");
        let tools = v
            .get("result")
            .and_then(|r| r.get("tools"))
            .and_then(|t| t.as_array())
            .expect("tools array");
        let names: std::collections::HashSet<&str> =
            tools.iter().filter_map(|t| t.get("name").and_then(|n| n.as_str())).collect();
        for required in ["search_documentation", "generate_context", "get_repository_status", "sync_repository"] {
            assert!(names.contains(required), "missing tool: {required}");
        }
    }

    // get_repository_status with no repositories configured
    {
        let v = replies_by_id.get(&3).expect("get_repository_status reply");
        let result = v.get("result").expect("tools/call result");
        assert_eq!(
            result.get("isError").and_then(|x| x.as_bool()),
            Some(false),
            "get_repository_status should not error when no repositories are configured"
        );
        let text = result
            .get("content")
            .and_then(|c| c.as_array())
            .and_then(|a| a.first())
            .and_then(|x| x.get("text"))
            .and_then(|x| x.as_str())
            .expect("get_repository_status text");
        let parsed: serde_json::Value = serde_json::from_str(text).expect("status text is json");
        assert!(parsed.as_object().expect("status is a json object").is_empty());
    }

    // prompts/get
    {
        let v = replies_by_id.get(&4).expect("prompts/get reply");
        let result = v.get("result").expect("prompts/get result");
        let messages = result.get("messages").and_then(|m| m.as_array()).expect("prompt messages");
        let text = messages
            .first()
            .and_then(|m| m.get("content"))
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .expect("prompt text");
        assert!(text.contains("the Scheduler type"), "prompt should interpolate the subject argument");
    }
}
