//! QuickJS 绑定：把 HostApi 注入解释器全局作用域
//!
//! 参数经 JSON.stringify 转为 ScriptArg，返回值经 JSON.parse 转回 JS。
//! fetch 响应包装与 setTimeout 在 PRELUDE 中用 JS 实现，不在 Rust 侧持有 JS 函数。

use std::sync::Arc;

use rquickjs::function::Rest;
use rquickjs::{Ctx, Exception, Function, Object, Value};
use serde_json::Value as Json;

use crate::core::BotError;
use crate::sandbox::host::{arg, HostApi, ScriptArg};

/// 在用户代码之前执行的脚本
const PRELUDE: &str = r#"
(function () {
  const rawFetch = globalThis.__fetch;
  delete globalThis.__fetch;
  globalThis.fetch = function (url, options) {
    const r = rawFetch(url, options === undefined ? null : options);
    return {
      status: r.status,
      statusText: r.statusText,
      ok: r.ok,
      headers: r.headers,
      truncated: r.truncated,
      text() { return r.body; },
      json() { return JSON.parse(r.body); },
    };
  };

  const timers = [];
  let nextTimer = 1;
  globalThis.setTimeout = function (fn, ms) {
    if (typeof fn !== 'function') throw new TypeError('setTimeout callback must be a function');
    const id = nextTimer++;
    timers.push({ id, fn, due: Date.now() + (Number(ms) || 0) });
    return id;
  };
  globalThis.clearTimeout = function (id) {
    const i = timers.findIndex(t => t.id === id);
    if (i >= 0) timers.splice(i, 1);
  };
  Object.defineProperty(globalThis, '__runDueTimers', {
    enumerable: false,
    value: function () {
      const now = Date.now();
      const due = timers.filter(t => t.due <= now);
      timers.length = 0;
      for (const t of due) {
        try { t.fn(); } catch (e) { console.error('timer callback failed: ' + e); }
      }
      return due.length;
    },
  });
})();
"#;

/// 注入 teamwork 对象、工具函数、prev_output / inputData，然后执行 PRELUDE
pub fn install<'js>(ctx: &Ctx<'js>, host: Arc<HostApi>, prev_output: &[String]) -> rquickjs::Result<()> {
    let globals = ctx.globals();

    let teamwork = Object::new(ctx.clone())?;
    {
        let h = host.clone();
        bind(ctx, &teamwork, "listProjects", move |a| h.list_projects(arg(a, 0)))?;
        let h = host.clone();
        bind(ctx, &teamwork, "listTasks", move |a| h.list_tasks(arg(a, 0)))?;
        let h = host.clone();
        bind(ctx, &teamwork, "getCurrentProject", move |_| h.get_current_project())?;
        let h = host.clone();
        bind(ctx, &teamwork, "createProject", move |a| h.create_project(arg(a, 0), arg(a, 1)))?;
        let h = host.clone();
        bind(ctx, &teamwork, "updateProject", move |a| h.update_project(arg(a, 0), arg(a, 1)))?;
        let h = host.clone();
        bind(ctx, &teamwork, "deleteProject", move |a| h.delete_project(arg(a, 0)))?;
        let h = host.clone();
        bind(ctx, &teamwork, "createTask", move |a| h.create_task(arg(a, 0), arg(a, 1)))?;
        let h = host.clone();
        bind(ctx, &teamwork, "updateTask", move |a| h.update_task(arg(a, 0), arg(a, 1)))?;
        let h = host.clone();
        bind(ctx, &teamwork, "deleteTask", move |a| h.delete_task(arg(a, 0)))?;
        let h = host.clone();
        bind(ctx, &teamwork, "setCurrentProject", move |a| h.set_current_project(arg(a, 0)))?;
        let h = host.clone();
        bind(ctx, &teamwork, "sendMessageWithButtons", move |a| {
            h.send_message_with_buttons(arg(a, 0), arg(a, 1))
        })?;
    }
    globals.set("teamwork", teamwork)?;

    let h = host.clone();
    bind(ctx, &globals, "message", move |a| {
        h.message(a);
        Ok(Json::Null)
    })?;
    let h = host.clone();
    bind(ctx, &globals, "output", move |a| {
        h.output(arg(a, 0));
        Ok(Json::Null)
    })?;
    let h = host.clone();
    bind(ctx, &globals, "debug", move |a| {
        h.debug(arg(a, 0));
        Ok(Json::Null)
    })?;
    let h = host.clone();
    bind(ctx, &globals, "__fetch", move |a| h.fetch(arg(a, 0), arg(a, 1)))?;

    let console = Object::new(ctx.clone())?;
    for level in ["log", "info", "warn", "error", "debug"] {
        let h = host.clone();
        bind(ctx, &console, level, move |a| {
            h.log(level, a);
            Ok(Json::Null)
        })?;
    }
    globals.set("console", console)?;

    globals.set("prev_output", prev_output.to_vec())?;
    globals.set("inputData", prev_output.first().cloned())?;

    ctx.eval::<(), _>(PRELUDE)
}

/// 执行到期的定时器回调（主体结束后调用一次）
pub fn run_due_timers(ctx: &Ctx<'_>) -> usize {
    match ctx.eval::<f64, _>("__runDueTimers()") {
        Ok(n) => n as usize,
        Err(e) => {
            tracing::debug!(error = %e, "Timer drain failed");
            0
        }
    }
}

/// 注册一个宿主函数：JS 参数 → ScriptArg，Ok → JS 值，Err → 抛出异常
fn bind<'js, F>(ctx: &Ctx<'js>, target: &Object<'js>, name: &str, f: F) -> rquickjs::Result<()>
where
    F: Fn(&[ScriptArg]) -> Result<Json, BotError> + 'static,
{
    let func = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'js>, args: Rest<Value<'js>>| -> rquickjs::Result<Value<'js>> {
            let args = args
                .0
                .iter()
                .map(|v| to_script_arg(&ctx, v))
                .collect::<rquickjs::Result<Vec<_>>>()?;
            match f(&args) {
                Ok(v) => from_json(&ctx, &v),
                Err(e) => Err(throw(&ctx, &e)),
            }
        },
    )?;
    target.set(name, func)
}

fn throw(ctx: &Ctx<'_>, err: &BotError) -> rquickjs::Error {
    match err {
        BotError::Validation(m) => Exception::throw_type(ctx, &format!("teamwork: {m}")),
        BotError::Runtime(m) => Exception::throw_message(ctx, m),
        other => Exception::throw_message(ctx, &other.to_string()),
    }
}

/// JS 值 → ScriptArg；undefined、函数、symbol 视为 Undefined
pub fn to_script_arg<'js>(ctx: &Ctx<'js>, v: &Value<'js>) -> rquickjs::Result<ScriptArg> {
    if v.is_undefined() || v.is_function() {
        return Ok(ScriptArg::Undefined);
    }
    match ctx.json_stringify(v.clone())? {
        Some(s) => {
            let text = s.to_string()?;
            serde_json::from_str(&text)
                .map(ScriptArg::Json)
                .map_err(|e| Exception::throw_type(ctx, &format!("value is not JSON-compatible: {e}")))
        }
        None => Ok(ScriptArg::Undefined),
    }
}

fn from_json<'js>(ctx: &Ctx<'js>, v: &Json) -> rquickjs::Result<Value<'js>> {
    let text = serde_json::to_string(v)
        .map_err(|e| Exception::throw_message(ctx, &format!("serialize host result: {e}")))?;
    ctx.json_parse(text)
}
