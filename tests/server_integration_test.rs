//! AgentServer 集成测试：用户工具、数据源与任务、归档记忆、命令与删除

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};
    use uuid::Uuid;

    use mnemo::config::AppConfig;
    use mnemo::core::{AgentError, JobStatus};
    use mnemo::llm::{HashEmbedder, ModelResponse, ScriptedModel};
    use mnemo::memory::{InMemoryPassageStore, InMemoryRecallStore, Role};
    use mnemo::runtime::ChainState;
    use mnemo::server::{
        AgentServer, CreateAgentRequest, CreateToolRequest, Document, SendMessageResult,
        ServerComponents, UpdateAgentRequest,
    };
    use mnemo::store::InMemoryEntityStore;
    use mnemo::tools::{DisabledSandbox, BASE_TOOLS};

    fn server(model: ScriptedModel) -> AgentServer {
        let components = ServerComponents {
            entities: Arc::new(InMemoryEntityStore::new()),
            recall: Arc::new(InMemoryRecallStore::new()),
            passages: Arc::new(InMemoryPassageStore::new()),
            embedder: Arc::new(HashEmbedder::new(64)),
            model: Arc::new(model),
            sandbox: Arc::new(DisabledSandbox),
        };
        AgentServer::new(AppConfig::default(), components).unwrap()
    }

    async fn setup(server: &AgentServer) -> (Uuid, Uuid) {
        let user = server.create_user("tester").await.unwrap();
        let agent = server
            .create_agent(CreateAgentRequest {
                user_id: user.id,
                name: Some("sam".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        (user.id, agent.id)
    }

    fn tool_request(user_id: Uuid, source: &str) -> CreateToolRequest {
        CreateToolRequest {
            user_id,
            source_type: "python".into(),
            source_code: source.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_agent_names_are_unique_per_user() {
        let s = server(ScriptedModel::repeating(ModelResponse::thought("ok")));
        let (user_id, _) = setup(&s).await;
        let dup = s
            .create_agent(CreateAgentRequest {
                user_id,
                name: Some("sam".into()),
                ..Default::default()
            })
            .await;
        assert!(matches!(dup, Err(AgentError::Validation(_))));

        let unknown_tool = s
            .create_agent(CreateAgentRequest {
                user_id,
                tools: Some(vec!["teleport".into()]),
                ..Default::default()
            })
            .await;
        assert!(matches!(unknown_tool, Err(AgentError::NotFound { .. })));
        assert_eq!(s.list_agents(user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_user_tool_lifecycle() {
        let s = server(ScriptedModel::replies(vec![
            ModelResponse::thought("adding").with_tool_call("add", json!({"a": 1})),
            ModelResponse::thought("it failed"),
        ]));
        let (user_id, agent_id) = setup(&s).await;

        let tool = s
            .create_tool(tool_request(user_id, "def add(a: int, b: int = 2):\n    return a + b"))
            .await
            .unwrap();
        assert_eq!(tool.name, "add");
        assert_eq!(tool.json_schema["parameters"]["required"], json!(["a"]));

        let names: Vec<String> = s
            .list_tools(user_id)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names.len(), BASE_TOOLS.len() + 1);
        assert!(names.contains(&"add".to_string()));

        let again = s
            .create_tool(tool_request(user_id, "def add(a: int):\n    return a"))
            .await;
        assert!(matches!(again, Err(AgentError::Validation(_))));
        let mut upsert = tool_request(user_id, "def add(a: int):\n    return a");
        upsert.update = true;
        let replaced = s.create_tool(upsert).await.unwrap();
        assert_eq!(replaced.id, tool.id);

        let builtin = s
            .create_tool(tool_request(user_id, "def send_message(message: str):\n    pass"))
            .await;
        assert!(matches!(builtin, Err(AgentError::Validation(_))));

        let mut tools: Vec<String> = BASE_TOOLS.iter().map(|t| t.to_string()).collect();
        tools.push("add".into());
        s.update_agent(
            agent_id,
            UpdateAgentRequest {
                tools: Some(tools),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // 沙箱关闭：调用失败后链继续一轮
        let SendMessageResult::Complete(r) = s.send_message(agent_id, "1 + 2?", false).await.unwrap()
        else {
            panic!("expected a complete response");
        };
        assert_eq!(r.final_state, Some(ChainState::Yielded));
        let tool_msg = r.messages.iter().find(|m| m.role == Role::Tool).unwrap();
        let v: Value = serde_json::from_str(&tool_msg.text).unwrap();
        assert_eq!(v["status"], "Failed");

        s.delete_tool(tool.id).await.unwrap();
        assert_eq!(s.list_tools(user_id).await.unwrap().len(), BASE_TOOLS.len());
    }

    #[tokio::test]
    async fn test_same_tool_name_is_scoped_to_each_user() {
        let s = server(ScriptedModel::repeating(ModelResponse::thought("ok")));
        let alice = s.create_user("alice").await.unwrap();
        let bob = s.create_user("bob").await.unwrap();

        let mut alice_req = tool_request(alice.id, "def add(a: int):\n    return a");
        alice_req.description = Some("alice's add".into());
        s.create_tool(alice_req).await.unwrap();
        let mut bob_req = tool_request(bob.id, "def add(a: int, b: int):\n    return a + b");
        bob_req.description = Some("bob's add".into());
        let bob_tool = s.create_tool(bob_req).await.unwrap();

        let describe = |tools: Vec<mnemo::llm::ToolSchema>| {
            tools
                .into_iter()
                .find(|t| t.name == "add")
                .map(|t| t.description)
        };
        assert_eq!(
            describe(s.list_tools(alice.id).await.unwrap()).as_deref(),
            Some("alice's add")
        );
        assert_eq!(
            describe(s.list_tools(bob.id).await.unwrap()).as_deref(),
            Some("bob's add")
        );

        s.delete_tool(bob_tool.id).await.unwrap();
        assert_eq!(
            describe(s.list_tools(alice.id).await.unwrap()).as_deref(),
            Some("alice's add")
        );
        assert!(describe(s.list_tools(bob.id).await.unwrap()).is_none());

        // bob 的 agent 看不到 alice 的工具
        let mut tools: Vec<String> = BASE_TOOLS.iter().map(|t| t.to_string()).collect();
        tools.push("add".into());
        let denied = s
            .create_agent(CreateAgentRequest {
                user_id: bob.id,
                tools: Some(tools.clone()),
                ..Default::default()
            })
            .await;
        assert!(matches!(denied, Err(AgentError::NotFound { .. })));
        s.create_agent(CreateAgentRequest {
            user_id: alice.id,
            tools: Some(tools),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_source_load_and_attach() {
        let s = server(ScriptedModel::repeating(ModelResponse::thought("ok")));
        let (user_id, agent_id) = setup(&s).await;
        let source = s.create_source(user_id, "handbook").await.unwrap();

        let job = s
            .load_source(
                source.id,
                vec![
                    Document {
                        doc_id: "a.txt".into(),
                        text: "Vacation requests go through the team lead.".into(),
                    },
                    Document {
                        doc_id: "b.txt".into(),
                        text: "Expense reports are due on the fifth of each month.".into(),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.metadata["num_documents"], json!(2));
        let num_passages = job.metadata["num_passages"].as_u64().unwrap() as usize;
        assert!(num_passages >= 2);
        assert_eq!(s.get_job(job.id).await.unwrap().status, JobStatus::Completed);
        assert!(s.list_active_jobs(user_id).await.unwrap().is_empty());

        assert_eq!(s.attach_source(agent_id, source.id).await.unwrap(), num_passages);
        assert_eq!(s.attach_source(agent_id, source.id).await.unwrap(), 0);
        assert_eq!(s.list_attached_sources(agent_id).await.unwrap(), vec![source.id]);
        assert_eq!(s.get_archival_summary(agent_id).await.unwrap().size, num_passages);

        let hits = s
            .search_archival(agent_id, "Expense reports are due on the fifth of each month.", 1)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].passage.text.contains("Expense"));
    }

    #[tokio::test]
    async fn test_archival_insert_updates_system_prompt() {
        let s = server(ScriptedModel::repeating(ModelResponse::thought("ok")));
        let (_, agent_id) = setup(&s).await;
        let ids = s
            .insert_archival(agent_id, "The user's cat is named Miso.")
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(s.get_archival_summary(agent_id).await.unwrap().size, 1);
        let system = &s.get_in_context_messages(agent_id).await.unwrap()[0];
        assert!(system.text.contains("1 total memories"));

        s.delete_archival(agent_id, ids[0]).await.unwrap();
        assert_eq!(s.get_archival_summary(agent_id).await.unwrap().size, 0);
    }

    #[tokio::test]
    async fn test_commands() {
        let s = server(ScriptedModel::repeating(
            ModelResponse::thought("hmm").with_tool_call("send_message", json!({"message": "hi"})),
        ));
        let (_, agent_id) = setup(&s).await;
        s.send_message(agent_id, "hello", false).await.unwrap();

        let r = s.run_command(agent_id, "/rewrite hello there").await.unwrap();
        assert!(r.messages[0].tool_call.as_ref().unwrap().arguments.contains("hello there"));
        assert!(r.final_state.is_none());

        let r = s.run_command(agent_id, "/heartbeat").await.unwrap();
        assert_eq!(r.final_state, Some(ChainState::Yielded));

        let before = s.get_in_context_messages(agent_id).await.unwrap().len();
        let r = s.run_command(agent_id, "/pop 2").await.unwrap();
        assert_eq!(r.messages.len(), 2);
        assert_eq!(
            s.get_in_context_messages(agent_id).await.unwrap().len(),
            before - 2
        );
        assert_eq!(
            s.get_agent_state(agent_id).await.unwrap().message_ids.len(),
            before - 2
        );

        assert!(matches!(
            s.run_command(agent_id, "/dance").await,
            Err(AgentError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_agent_removes_everything() {
        let s = server(ScriptedModel::repeating(ModelResponse::thought("ok")));
        let (user_id, agent_id) = setup(&s).await;
        s.send_message(agent_id, "hello", false).await.unwrap();
        s.insert_archival(agent_id, "remember me").await.unwrap();

        s.delete_agent(agent_id).await.unwrap();
        assert!(matches!(
            s.get_agent_state(agent_id).await,
            Err(AgentError::NotFound { .. })
        ));
        assert!(matches!(
            s.send_message(agent_id, "hello?", false).await,
            Err(AgentError::NotFound { .. })
        ));
        assert!(s.list_agents(user_id).await.unwrap().is_empty());
        assert!(matches!(
            s.delete_agent(agent_id).await,
            Err(AgentError::NotFound { .. })
        ));
    }

    fn docs() -> Vec<Document> {
        vec![Document {
            doc_id: "a.txt".into(),
            text: "Vacation requests go through the team lead.".into(),
        }]
    }

    #[tokio::test]
    async fn test_delete_user_removes_owned_entities() {
        let s = server(ScriptedModel::repeating(ModelResponse::thought("ok")));
        let (user_id, agent_id) = setup(&s).await;
        s.create_tool(tool_request(user_id, "def add(a: int):\n    return a"))
            .await
            .unwrap();
        let source = s.create_source(user_id, "handbook").await.unwrap();
        let job = s.load_source(source.id, docs()).await.unwrap();

        s.delete_user(user_id).await.unwrap();
        assert!(matches!(
            s.get_agent_state(agent_id).await,
            Err(AgentError::NotFound { .. })
        ));
        assert!(matches!(s.list_tools(user_id).await, Err(AgentError::NotFound { .. })));
        assert!(matches!(s.get_job(job.id).await, Err(AgentError::NotFound { .. })));
        assert!(matches!(
            s.load_source(source.id, docs()).await,
            Err(AgentError::NotFound { .. })
        ));
        assert!(matches!(s.delete_user(user_id).await, Err(AgentError::NotFound { .. })));

        // 其他用户可以重新使用同名工具
        let other = s.create_user("other").await.unwrap();
        s.create_tool(tool_request(other.id, "def add(a: int):\n    return a"))
            .await
            .unwrap();
        assert_eq!(s.list_tools(other.id).await.unwrap().len(), BASE_TOOLS.len() + 1);
    }

    #[tokio::test]
    async fn test_source_rename_and_delete() {
        let s = server(ScriptedModel::repeating(ModelResponse::thought("ok")));
        let (user_id, agent_id) = setup(&s).await;
        let handbook = s.create_source(user_id, "handbook").await.unwrap();
        s.create_source(user_id, "wiki").await.unwrap();

        assert!(matches!(
            s.update_source(handbook.id, "wiki").await,
            Err(AgentError::Validation(_))
        ));
        assert!(matches!(
            s.update_source(handbook.id, "  ").await,
            Err(AgentError::Validation(_))
        ));
        let renamed = s.update_source(handbook.id, "policies").await.unwrap();
        assert_eq!(renamed.name, "policies");
        let names: Vec<String> = s
            .list_sources(user_id)
            .await
            .unwrap()
            .into_iter()
            .map(|src| src.name)
            .collect();
        assert!(names.contains(&"policies".to_string()));

        s.load_source(handbook.id, docs()).await.unwrap();
        let copied = s.attach_source(agent_id, handbook.id).await.unwrap();
        assert!(copied >= 1);

        s.delete_source(handbook.id).await.unwrap();
        assert!(s.list_attached_sources(agent_id).await.unwrap().is_empty());
        // agent 的副本仍在
        assert_eq!(s.get_archival_summary(agent_id).await.unwrap().size, copied);
        assert!(matches!(
            s.attach_source(agent_id, handbook.id).await,
            Err(AgentError::NotFound { .. })
        ));
        assert!(matches!(
            s.delete_source(handbook.id).await,
            Err(AgentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_finished_job() {
        let s = server(ScriptedModel::repeating(ModelResponse::thought("ok")));
        let (user_id, _) = setup(&s).await;
        let source = s.create_source(user_id, "handbook").await.unwrap();
        let job = s.load_source(source.id, docs()).await.unwrap();
        assert_eq!(s.list_jobs(user_id).await.unwrap().len(), 1);

        s.delete_job(job.id).await.unwrap();
        assert!(s.list_jobs(user_id).await.unwrap().is_empty());
        assert!(matches!(s.delete_job(job.id).await, Err(AgentError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_archival_page_and_single_message() {
        let s = server(ScriptedModel::repeating(ModelResponse::thought("ok")));
        let (_, agent_id) = setup(&s).await;
        let mut ids = Vec::new();
        for text in ["first fact", "second fact", "third fact"] {
            ids.extend(s.insert_archival(agent_id, text).await.unwrap());
        }
        let page: Vec<Uuid> = s
            .get_archival_page(agent_id, 1, 5)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(page, ids[1..].to_vec());
        assert!(matches!(
            s.get_archival_page(agent_id, 0, -1).await,
            Err(AgentError::InvalidRange { .. })
        ));

        s.send_message(agent_id, "hello", false).await.unwrap();
        let latest = &s.get_messages(agent_id, 0, 1).await.unwrap()[0];
        let fetched = s.get_message(agent_id, latest.id).await.unwrap();
        assert_eq!(fetched.id, latest.id);
        assert_eq!(fetched.text, latest.text);
        assert!(matches!(
            s.get_message(agent_id, Uuid::new_v4()).await,
            Err(AgentError::NotFound { .. })
        ));
    }
}
