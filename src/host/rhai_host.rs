use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rhai::module_resolvers::{FileModuleResolver, ModuleResolversCollection};
use rhai::{AST, Array, Dynamic, Engine, ImmutableString, Scope};
use tenant_plugin::{
    ExecutionHost, LoadRequest, OutboundAction, PluginError, RunnableUnit, TenantEvent, UnitState,
};
use tracing::{debug, info};

use super::{ENTRY_POINT, stdlib};

type Outbox = Arc<Mutex<Vec<OutboundAction>>>;

fn push(outbox: &Outbox, action: OutboundAction) {
    outbox.lock().unwrap_or_else(|e| e.into_inner()).push(action);
}

/// Hosts tenant programs written in [Rhai](https://rhai.rs).
///
/// A program must define `fn on_update(update)`. It receives the provider
/// update as an object map and talks back through the registered functions:
///
/// ```rhai
/// fn on_update(update) {
///     let chat = update.message.chat.id;
///     reply(chat, "You said: " + update.message.text);
///     reply_buttons(chat, "More?", ["yes", "no"]);
/// }
/// ```
///
/// Returning a non-empty string from `on_update` is shorthand for a reply to
/// the originating chat. Top-level statements run once at load, where a
/// failure is an initialisation error, and again before every call, so they
/// should only declare things.
#[derive(Debug, Clone)]
pub struct RhaiHost {
    max_operations: u64,
    modules_dir: PathBuf,
}

impl RhaiHost {
    pub fn new(max_operations: u64, modules_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_operations,
            modules_dir: modules_dir.into(),
        }
    }

    fn engine(&self, route_id: &str, outbox: &Outbox) -> Engine {
        let mut engine = Engine::new();
        engine.set_max_operations(self.max_operations);

        let mut resolvers = ModuleResolversCollection::new();
        resolvers.push(stdlib::resolver(route_id));
        resolvers.push(FileModuleResolver::new_with_path(&self.modules_dir));
        engine.set_module_resolver(resolvers);

        let out = outbox.clone();
        engine.register_fn("reply", move |chat_id: i64, text: ImmutableString| {
            push(
                &out,
                OutboundAction::Reply {
                    chat_id,
                    text: text.to_string(),
                },
            );
        });
        let out = outbox.clone();
        engine.register_fn(
            "reply_buttons",
            move |chat_id: i64, text: ImmutableString, buttons: Array| {
                push(
                    &out,
                    OutboundAction::ReplyWithButtons {
                        chat_id,
                        text: text.to_string(),
                        buttons: buttons.iter().map(|b| b.to_string()).collect(),
                    },
                );
            },
        );
        let out = outbox.clone();
        engine.register_fn(
            "answer_callback",
            move |callback_id: ImmutableString, text: ImmutableString| {
                push(
                    &out,
                    OutboundAction::AnswerCallback {
                        callback_id: callback_id.to_string(),
                        text: (!text.is_empty()).then(|| text.to_string()),
                    },
                );
            },
        );
        let route = route_id.to_string();
        engine.on_print(move |s| info!(route = %route, "script: {s}"));
        let route = route_id.to_string();
        engine.on_debug(move |s, _, pos| debug!(route = %route, "script {pos}: {s}"));

        engine
    }
}

fn compile_checked(engine: &Engine, source: &str) -> Result<AST, PluginError> {
    let ast = engine
        .compile(source)
        .map_err(|e| PluginError::Syntax(e.to_string()))?;
    let has_entry = ast
        .iter_functions()
        .any(|f| f.name == ENTRY_POINT && f.params.len() == 1);
    if !has_entry {
        return Err(PluginError::MissingEntryPoint(format!("{ENTRY_POINT}(update)")));
    }
    Ok(ast)
}

#[async_trait]
impl ExecutionHost for RhaiHost {
    fn program_extension(&self) -> &'static str {
        "rhai"
    }

    fn validate(&self, source: &str) -> Result<(), PluginError> {
        // a bare engine: parsing never touches registered functions or resolvers
        let mut engine = Engine::new();
        engine.set_max_operations(self.max_operations);
        compile_checked(&engine, source).map(|_| ())
    }

    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn RunnableUnit>, PluginError> {
        let outbox: Outbox = Arc::new(Mutex::new(Vec::new()));
        let engine = self.engine(&request.route_id, &outbox);
        let route_id = request.route_id.clone();

        let (engine, ast) = tokio::task::spawn_blocking(move || {
            let ast = compile_checked(&engine, &request.source)?;
            engine
                .run_ast(&ast)
                .map_err(|e| PluginError::Init(e.to_string()))?;
            Ok::<_, PluginError>((engine, ast))
        })
        .await
        .map_err(|e| PluginError::Init(format!("loader task failed: {e}")))??;

        // anything sent while initialising is discarded
        outbox.lock().unwrap_or_else(|e| e.into_inner()).clear();
        debug!(route = %route_id, "program loaded");

        Ok(Arc::new(RhaiUnit {
            route_id,
            engine: Arc::new(engine),
            ast: Arc::new(ast),
            outbox,
            state: Mutex::new(UnitState::Loaded),
            deliver_lock: tokio::sync::Mutex::new(()),
        }))
    }
}

/// One loaded program. Events are handled one at a time.
pub struct RhaiUnit {
    route_id: String,
    engine: Arc<Engine>,
    ast: Arc<AST>,
    outbox: Outbox,
    state: Mutex<UnitState>,
    deliver_lock: tokio::sync::Mutex<()>,
}

impl RhaiUnit {
    fn set_state(&self, state: UnitState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

#[async_trait]
impl RunnableUnit for RhaiUnit {
    fn name(&self) -> String {
        self.route_id.clone()
    }

    fn state(&self) -> UnitState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn start(&self) -> Result<(), PluginError> {
        match self.state() {
            UnitState::Loaded => {
                self.set_state(UnitState::Running);
                Ok(())
            }
            UnitState::Running => Ok(()),
            UnitState::Stopped => Err(PluginError::InvalidState),
        }
    }

    async fn stop(&self) -> Result<(), PluginError> {
        self.set_state(UnitState::Stopped);
        Ok(())
    }

    async fn deliver(&self, event: TenantEvent) -> Result<Vec<OutboundAction>, PluginError> {
        if self.state() != UnitState::Running {
            return Err(PluginError::InvalidState);
        }
        let _guard = self.deliver_lock.lock().await;

        let chat_id = event.chat_id();
        let update = rhai::serde::to_dynamic(&event.payload)
            .map_err(|e| PluginError::Runtime(e.to_string()))?;
        let engine = self.engine.clone();
        let ast = self.ast.clone();
        let outbox = self.outbox.clone();

        tokio::task::spawn_blocking(move || {
            outbox.lock().unwrap_or_else(|e| e.into_inner()).clear();
            let returned = engine
                .call_fn::<Dynamic>(&mut Scope::new(), &ast, ENTRY_POINT, (update,))
                .map_err(|e| PluginError::Runtime(e.to_string()))?;

            let mut actions =
                std::mem::take(&mut *outbox.lock().unwrap_or_else(|e| e.into_inner()));
            if let (Some(chat_id), Ok(text)) = (chat_id, returned.into_string()) {
                if !text.is_empty() {
                    actions.push(OutboundAction::Reply { chat_id, text });
                }
            }
            Ok(actions)
        })
        .await
        .map_err(|e| PluginError::Runtime(format!("handler task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ECHO: &str = r#"
        fn on_update(update) {
            let chat = update.message.chat.id;
            reply(chat, "echo: " + update.message.text);
            reply_buttons(chat, "again?", ["yes", "no"]);
        }
    "#;

    fn host() -> RhaiHost {
        RhaiHost::new(10_000, std::env::temp_dir())
    }

    fn message(text: &str) -> TenantEvent {
        TenantEvent::new(
            "route1",
            json!({"update_id": 1, "message": {"chat": {"id": 42}, "text": text}}),
        )
    }

    async fn running(source: &str) -> Arc<dyn RunnableUnit> {
        let unit = host()
            .load(LoadRequest {
                route_id: "route1".into(),
                source: source.into(),
            })
            .await
            .unwrap();
        unit.start().await.unwrap();
        unit
    }

    #[test]
    fn validate_accepts_entry_point() {
        assert_eq!(host().validate(ECHO), Ok(()));
    }

    #[test]
    fn validate_rejects_missing_entry_point() {
        let err = host().validate("fn other(x) { x }").unwrap_err();
        assert!(matches!(err, PluginError::MissingEntryPoint(_)));
    }

    #[test]
    fn validate_rejects_wrong_arity() {
        let err = host().validate("fn on_update() { 1 }").unwrap_err();
        assert!(matches!(err, PluginError::MissingEntryPoint(_)));
    }

    #[test]
    fn validate_rejects_syntax_errors() {
        let err = host().validate("fn on_update(u) { let = ; }").unwrap_err();
        assert!(matches!(err, PluginError::Syntax(_)));
    }

    #[tokio::test]
    async fn deliver_collects_replies() {
        let unit = running(ECHO).await;
        let actions = unit.deliver(message("hi")).await.unwrap();
        assert_eq!(
            actions,
            vec![
                OutboundAction::Reply {
                    chat_id: 42,
                    text: "echo: hi".into()
                },
                OutboundAction::ReplyWithButtons {
                    chat_id: 42,
                    text: "again?".into(),
                    buttons: vec!["yes".into(), "no".into()]
                },
            ]
        );
        // the outbox does not leak into the next event
        let again = unit.deliver(message("second")).await.unwrap();
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn returned_string_is_a_reply() {
        let unit = running(r#"fn on_update(u) { "pong" }"#).await;
        let actions = unit.deliver(message("ping")).await.unwrap();
        assert_eq!(
            actions,
            vec![OutboundAction::Reply {
                chat_id: 42,
                text: "pong".into()
            }]
        );
    }

    #[tokio::test]
    async fn stdlib_modules_are_importable() {
        let source = r#"
            fn on_update(u) {
                import "json" as json;
                import "platform" as platform;
                reply(u.message.chat.id, platform::route_id() + json::stringify(#{ a: 1 }));
            }
        "#;
        let unit = running(source).await;
        let actions = unit.deliver(message("x")).await.unwrap();
        assert_eq!(
            actions,
            vec![OutboundAction::Reply {
                chat_id: 42,
                text: r#"route1{"a":1}"#.into()
            }]
        );
    }

    #[tokio::test]
    async fn failing_top_level_code_is_init_error() {
        let err = host()
            .load(LoadRequest {
                route_id: "r".into(),
                source: r#"throw "no config"; fn on_update(u) {}"#.into(),
            })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, PluginError::Init(_)));
    }

    #[tokio::test]
    async fn runaway_handler_is_stopped_by_operation_limit() {
        let unit = running("fn on_update(u) { loop { } }").await;
        let err = unit.deliver(message("x")).await.unwrap_err();
        assert!(matches!(err, PluginError::Runtime(_)));
    }

    #[tokio::test]
    async fn deliver_requires_running_unit() {
        let unit = host()
            .load(LoadRequest {
                route_id: "r".into(),
                source: ECHO.into(),
            })
            .await
            .unwrap();
        assert_eq!(unit.state(), UnitState::Loaded);
        assert_eq!(unit.deliver(message("x")).await, Err(PluginError::InvalidState));

        unit.start().await.unwrap();
        unit.stop().await.unwrap();
        unit.stop().await.unwrap();
        assert_eq!(unit.state(), UnitState::Stopped);
        assert_eq!(unit.start().await, Err(PluginError::InvalidState));
    }
}
