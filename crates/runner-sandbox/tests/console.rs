//! Script console output is routed through `tracing` with the execution id.

use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};

use runner_sandbox::ops::JS_LOG_TARGET;
use runner_sandbox::{ExecutionContext, RunnerConfig, SandboxConfig, SandboxExecutor};
use serde_json::json;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Console lines are emitted on the isolate thread, so the subscriber must
/// be the global one.
fn captured() -> &'static Captured {
    static CAPTURED: OnceLock<Captured> = OnceLock::new();
    CAPTURED.get_or_init(|| {
        let sink = Captured::default();
        let writer = sink.clone();
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .init();
        sink
    })
}

fn output() -> String {
    String::from_utf8_lossy(&captured().0.lock().unwrap()).into_owned()
}

async fn run(execution_id: &str, code: &str) -> serde_json::Value {
    let config = RunnerConfig {
        workspace_slug: "acme".into(),
        task_id: "sync".into(),
        execution_id: execution_id.into(),
    };
    SandboxExecutor::new(SandboxConfig::default())
        .execute_bundle(&config, ExecutionContext::default(), code.into())
        .await
        .unwrap()
        .value
}

#[tokio::test]
async fn console_lines_carry_execution_id_and_level() {
    captured();
    let value = run(
        "sync-console",
        r#"function main() {
            console.log("hello", 1, { a: true });
            console.warn("careful");
            console.error(new Error("bad"));
            return "done";
        }"#,
    )
    .await;
    assert_eq!(value, json!("done"));

    let out = output();
    let hello = out
        .lines()
        .find(|l| l.contains("[sync-console] hello 1 {\"a\":true}"))
        .unwrap_or_else(|| panic!("missing console line in:\n{out}"));
    assert!(hello.contains("INFO"), "{hello}");
    assert!(hello.contains(JS_LOG_TARGET), "{hello}");

    let warn = out.lines().find(|l| l.contains("[sync-console] careful")).unwrap();
    assert!(warn.contains("WARN"), "{warn}");
    let error = out.lines().find(|l| l.contains("[sync-console] Error: bad")).unwrap();
    assert!(error.contains("ERROR"), "{error}");
}

#[tokio::test]
async fn timer_callback_errors_are_logged_not_fatal() {
    captured();
    let value = run(
        "sync-timer",
        r#"async function main() {
            setTimeout(() => { throw new Error("late failure"); }, 0);
            await new Promise((resolve) => setTimeout(resolve, 20));
            return "survived";
        }"#,
    )
    .await;
    assert_eq!(value, json!("survived"));
    assert!(output().contains("late failure"), "{}", output());
}
