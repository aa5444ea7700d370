use rhai::module_resolvers::StaticModuleResolver;
use rhai::{Dynamic, EvalAltResult, ImmutableString, Module};

/// Modules every program can `import` without installing anything.
pub fn resolver(route_id: &str) -> StaticModuleResolver {
    let mut resolver = StaticModuleResolver::new();
    resolver.insert("platform", platform(route_id));
    resolver.insert("os", os());
    resolver.insert("json", json());
    resolver.insert("time", time());
    resolver.insert("math", math());
    resolver.insert("text", text());
    resolver
}

fn platform(route_id: &str) -> Module {
    let mut m = Module::new();
    let route = route_id.to_string();
    m.set_native_fn("route_id", move || Ok(route.clone()));
    m.set_native_fn("version", || Ok(env!("CARGO_PKG_VERSION").to_string()));
    m
}

fn os() -> Module {
    let mut m = Module::new();
    m.set_native_fn("name", || Ok(std::env::consts::OS.to_string()));
    m.set_native_fn("arch", || Ok(std::env::consts::ARCH.to_string()));
    m
}

fn json() -> Module {
    let mut m = Module::new();
    m.set_native_fn("parse", |text: ImmutableString| {
        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| Box::<EvalAltResult>::from(format!("json::parse: {e}")))?;
        rhai::serde::to_dynamic(value)
    });
    m.set_native_fn("stringify", |value: Dynamic| {
        let value: serde_json::Value = rhai::serde::from_dynamic(&value)?;
        Ok(value.to_string())
    });
    m
}

fn time() -> Module {
    let mut m = Module::new();
    m.set_native_fn("now_unix", || Ok(chrono::Utc::now().timestamp()));
    m.set_native_fn("now_iso", || Ok(chrono::Utc::now().to_rfc3339()));
    m
}

fn math() -> Module {
    let mut m = Module::new();
    m.set_native_fn("clamp", |x: i64, lo: i64, hi: i64| Ok(x.max(lo).min(hi)));
    m.set_native_fn("min", |a: i64, b: i64| Ok(a.min(b)));
    m.set_native_fn("max", |a: i64, b: i64| Ok(a.max(b)));
    m
}

fn text() -> Module {
    let mut m = Module::new();
    m.set_native_fn("truncate", |s: ImmutableString, n: i64| {
        Ok(s.chars().take(n.max(0) as usize).collect::<String>())
    });
    m.set_native_fn("escape_html", |s: ImmutableString| {
        Ok(s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;"))
    });
    m
}
