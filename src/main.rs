//! Mnemo 命令行对话
//!
//! 加载配置、创建一个用户与 agent，然后逐行读取标准输入：
//! 普通文本作为用户消息（流式输出事件），`/` 开头的行作为命令（/rethink、/rewrite、/retry、/pop、/heartbeat、/memorywarning）。
//! 另有 /memory 显示核心记忆，/quit 退出。
//!
//! 配置：config/default.toml，环境变量 MNEMO__*（如 MNEMO__LLM__PROVIDER=openai）覆盖。

use anyhow::Context;
use mnemo::config::load_config;
use mnemo::runtime::AgentEvent;
use mnemo::{observability, AgentServer, CreateAgentRequest, SendMessageResult};
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    if let Some(dir) = &config.app.data_dir {
        std::fs::create_dir_all(dir).context("Failed to create data dir")?;
    }
    let server = AgentServer::from_config(config).context("Failed to start agent server")?;

    let user = server.create_user("local").await?;
    let agent = server
        .create_agent(CreateAgentRequest {
            user_id: user.id,
            name: Some("sam".into()),
            ..Default::default()
        })
        .await
        .context("Failed to create agent")?;
    tracing::info!(agent_id = %agent.id, "agent ready");
    println!("Talking to '{}'. Type /quit to exit.", agent.name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "/quit" | "/exit" => break,
            "/memory" => {
                let memory = server.get_core_memory(agent.id).await?;
                println!("{}", serde_json::to_string_pretty(&memory)?);
                continue;
            }
            _ => {}
        }

        if line.starts_with('/') {
            match server.run_command(agent.id, line).await {
                Ok(response) => {
                    for message in &response.messages {
                        print_event(&AgentEvent::from_message(message));
                    }
                }
                Err(e) => eprintln!("[error] {}", e),
            }
            continue;
        }

        match server.send_message(agent.id, line, true).await {
            Ok(SendMessageResult::Stream(mut rx)) => {
                while let Some(event) = rx.recv().await {
                    let done = matches!(event, AgentEvent::Done);
                    print_event(&event);
                    if done {
                        break;
                    }
                }
            }
            Ok(SendMessageResult::Complete(response)) => {
                for message in &response.messages {
                    print_event(&AgentEvent::from_message(message));
                }
            }
            Err(e) if e.is_client_error() => eprintln!("[invalid] {}", e),
            Err(e) => eprintln!("[error] {}", e),
        }
    }

    server.shutdown();
    Ok(())
}

fn print_event(event: &AgentEvent) {
    match event {
        AgentEvent::InternalMonologue { text, .. } if !text.is_empty() => {
            println!("  💭 {}", text)
        }
        AgentEvent::FunctionCall { name, arguments, .. } => {
            if name == "send_message" {
                let message = serde_json::from_str::<serde_json::Value>(arguments)
                    .ok()
                    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                    .unwrap_or_else(|| arguments.clone());
                println!("🤖 {}", message);
            } else {
                println!("  ⚡ {}({})", name, arguments);
            }
        }
        AgentEvent::FunctionReturn { ok: false, output, .. } => println!("  ❌ {}", output),
        AgentEvent::Heartbeat { reason } => println!("  💓 {:?}", reason),
        AgentEvent::Error { kind, text } => eprintln!("[{}] {}", kind, text),
        _ => {}
    }
}
