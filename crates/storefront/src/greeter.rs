//! Greeter service: the smallest possible service, with no state.

use serde_json::{json, Value};
use service_framework::action::{handler_fn, ActionDescriptor, GraphqlHint};
use service_framework::validator::{ParamRule, ParamSchema};
use service_framework::{ServiceError, ServiceSchema};

pub const SERVICE: &str = "greeter";

#[derive(Debug, Clone)]
pub struct GreeterSettings {
    pub default_name: String,
}

impl Default for GreeterSettings {
    fn default() -> Self {
        Self {
            default_name: "Moleculer".to_string(),
        }
    }
}

pub fn greeter_service(settings: GreeterSettings) -> ServiceSchema {
    let greeting = format!("Hello {}", settings.default_name);

    ServiceSchema::new(SERVICE)
        .action(
            ActionDescriptor::new(
                "hello",
                handler_fn(move |_ctx, _params| {
                    let greeting = greeting.clone();
                    async move { Ok(Value::String(greeting)) }
                }),
            )
            .rest("GET /hello")
            .graphql(GraphqlHint::Query("hello: String".into())),
        )
        .action(
            ActionDescriptor::new(
                "welcome",
                handler_fn(|_ctx, params| async move {
                    let name = params
                        .get("name")
                        .and_then(Value::as_str)
                        .ok_or_else(|| ServiceError::Handler("'name' is required".into()))?;
                    Ok::<_, ServiceError>(json!(format!("Welcome, {}", name.to_uppercase())))
                }),
            )
            .params(ParamSchema::new().field("name", ParamRule::string()))
            .rest("/welcome")
            .graphql(GraphqlHint::Mutation("welcome(name: String!): String".into())),
        )
}
