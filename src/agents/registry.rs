use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;

pub type AgentHandler = Box<dyn Fn(Value) -> BoxFuture<'static, Value> + Send + Sync>;

/// Process-wide `name -> handler` mapping (4.J). Registration happens
/// once at startup via `register`; lookups are read-only afterward —
/// there is no mutation path once the HTTP listener binds, matching the
/// immutability the teacher's process-wide singletons (provider
/// clients, the agent registry itself) are held to in 5. Concurrency &
/// Resource Model.
pub struct AgentRegistry {
    handlers: HashMap<String, AgentHandler>,
}

impl AgentRegistry {
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub async fn dispatch(&self, name: &str, params: Value) -> Option<Value> {
        let handler = self.handlers.get(name)?;
        Some(handler(params).await)
    }
}

pub struct AgentRegistryBuilder {
    handlers: HashMap<String, AgentHandler>,
}

impl AgentRegistryBuilder {
    pub fn register(mut self, name: &str, handler: AgentHandler) -> Self {
        self.handlers.insert(name.to_string(), handler);
        self
    }

    pub fn build(self) -> AgentRegistry {
        AgentRegistry {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn dispatch_runs_registered_handler() {
        let registry = AgentRegistry::builder()
            .register(
                "echo.ping",
                Box::new(|params| Box::pin(async move { json!({"echo": params}) })),
            )
            .build();

        let result = registry.dispatch("echo.ping", json!({"a": 1})).await.unwrap();
        assert_eq!(result, json!({"echo": {"a": 1}}));
    }

    #[tokio::test]
    async fn dispatch_returns_none_for_unknown_name() {
        let registry = AgentRegistry::builder().build();
        assert!(registry.dispatch("missing.agent", json!({})).await.is_none());
    }

    #[test]
    fn names_lists_registered_agents() {
        let registry = AgentRegistry::builder()
            .register("a.one", Box::new(|_| Box::pin(async { json!(null) })))
            .register("a.two", Box::new(|_| Box::pin(async { json!(null) })))
            .build();
        let mut names = registry.names();
        names.sort();
        assert_eq!(names, vec!["a.one".to_string(), "a.two".to_string()]);
    }
}
