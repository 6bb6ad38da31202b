//! JavaScript prelude that builds the script-facing capability surface.
//!
//! The prelude runs once per isolate, before any helper or bundle code. It
//! captures `Deno.core.ops` in a closure, installs the web-style globals and
//! the per-execution bindings, then deletes `Deno` and locks the function
//! constructors. What remains reachable from script code is exactly what is
//! defined here plus the V8 built-ins.
//!
//! The prelude leaves one global behind, `__runnerHost`, a frozen object the
//! executor uses to register helpers and to invoke the entry point.

use serde_json::json;

use crate::types::{ExecutionContext, ScriptFunction};

/// Script name used for the prelude in stack traces.
pub(crate) const BOOTSTRAP_SCRIPT_NAME: &str = "[runner:bootstrap]";

/// Build the prelude for one execution.
pub(crate) fn build_bootstrap(ctx: &ExecutionContext) -> Result<String, serde_json::Error> {
    let data = serde_json::to_string(&json!({
        "event": ctx.input,
        "variables": ctx.variables,
        "env": ctx.env,
        "workspaceSlug": ctx.workspace_slug,
    }))?;
    Ok(format!(
        "const __runnerHost = ({PRELUDE})(Deno.core.ops, {data});"
    ))
}

/// Whether `name` can be used as a plain JavaScript binding name.
pub(crate) fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Script that compiles one helper and registers it under its name.
///
/// The helper body runs inside a factory whose only parameter shadows
/// `fetch`, so helpers get the same sandboxed fetch as the script.
pub(crate) fn helper_script(function: &ScriptFunction) -> Result<String, serde_json::Error> {
    let name_json = serde_json::to_string(&function.name)?;
    Ok(format!(
        "__runnerHost.defineFunction({name_json}, (function (fetch) {{\n{code}\n;\nreturn typeof {name} === \"function\" ? {name} : undefined;\n}}));",
        code = function.code,
        name = function.name,
    ))
}

/// Script that registers a stub for a helper that could not be compiled.
pub(crate) fn broken_helper_script(name: &str, reason: &str) -> Result<String, serde_json::Error> {
    Ok(format!(
        "__runnerHost.defineBroken({}, {});",
        serde_json::to_string(name)?,
        serde_json::to_string(reason)?
    ))
}

/// Seals the `Functions` namespace.
pub(crate) const SEAL_FUNCTIONS_SCRIPT: &str = "__runnerHost.sealFunctions();";

/// Calls the entry point. The outcome arrives through `op_runner_set_result`.
pub(crate) const INVOKE_SCRIPT: &str = "__runnerHost.invoke();";

const PRELUDE: &str = r#"(ops, data) => {
    const realGlobal = globalThis;

    const expose = (name, value) => Object.defineProperty(realGlobal, name, {
        value, writable: true, configurable: true, enumerable: false,
    });
    const bind = (name, value) => Object.defineProperty(realGlobal, name, {
        value, writable: false, configurable: false, enumerable: false,
    });
    const deepFreeze = (value) => {
        if (value && typeof value === "object" && !Object.isFrozen(value)) {
            Object.freeze(value);
            for (const key of Object.keys(value)) deepFreeze(value[key]);
        }
        return value;
    };

    // --- console ---

    const formatArg = (arg) => {
        if (typeof arg === "string") return arg;
        if (arg instanceof Error) return arg.stack || `${arg.name}: ${arg.message}`;
        if (arg === undefined) return "undefined";
        if (typeof arg === "function") return `[Function ${arg.name || "anonymous"}]`;
        if (typeof arg === "bigint") return `${arg}n`;
        try {
            const json = JSON.stringify(arg);
            return json === undefined ? String(arg) : json;
        } catch {
            return String(arg);
        }
    };
    const log = (level, args) => ops.op_runner_log(level, args.map(formatArg).join(" "));

    const console = Object.freeze({
        log: (...args) => log("info", args),
        info: (...args) => log("info", args),
        debug: (...args) => log("debug", args),
        warn: (...args) => log("warn", args),
        error: (...args) => log("error", args),
        trace: (...args) => log("trace", args),
    });

    // --- timers ---

    const timers = new Map();
    let nextTimerId = 1;
    const schedule = (callback, delay, args, repeat) => {
        if (typeof callback !== "function") {
            throw new TypeError("Timer callback must be a function");
        }
        let ms = Math.floor(Number(delay));
        if (!(ms > 0)) ms = 0;
        if (ms > 2147483647) ms = 2147483647;
        if (repeat && ms < 1) ms = 1;
        const id = nextTimerId++;
        timers.set(id, true);
        const tick = () => {
            ops.op_runner_sleep(ms).then(() => {
                if (!timers.has(id)) return;
                if (!repeat) timers.delete(id);
                try {
                    callback(...args);
                } catch (err) {
                    log("error", ["Uncaught error in timer callback:", err]);
                }
                if (repeat && timers.has(id)) tick();
            });
        };
        tick();
        return id;
    };
    const clearTimer = (id) => { timers.delete(id); };

    // --- base64 and text encoding ---

    const btoa = (input) => ops.op_runner_btoa(String(input));
    const atob = (input) => ops.op_runner_atob(String(input));

    const UTF8_LABELS = ["utf-8", "utf8", "unicode-1-1-utf-8"];

    class TextEncoder {
        get encoding() { return "utf-8"; }
        encode(input = "") { return ops.op_runner_text_encode(String(input)); }
    }

    class TextDecoder {
        #fatal;
        #ignoreBOM;
        constructor(label = "utf-8", options = {}) {
            if (!UTF8_LABELS.includes(String(label).trim().toLowerCase())) {
                throw new RangeError(`The encoding label provided ('${label}') is invalid.`);
            }
            this.#fatal = Boolean(options.fatal);
            this.#ignoreBOM = Boolean(options.ignoreBOM);
        }
        get encoding() { return "utf-8"; }
        get fatal() { return this.#fatal; }
        get ignoreBOM() { return this.#ignoreBOM; }
        decode(input) {
            if (input === undefined) return "";
            let bytes;
            if (input instanceof ArrayBuffer) {
                bytes = new Uint8Array(input);
            } else if (ArrayBuffer.isView(input)) {
                bytes = new Uint8Array(input.buffer, input.byteOffset, input.byteLength);
            } else {
                throw new TypeError("The provided value is not of type '(ArrayBuffer or ArrayBufferView)'");
            }
            let text = ops.op_runner_text_decode(bytes, this.#fatal);
            if (!this.#ignoreBOM && text.charCodeAt(0) === 0xfeff) text = text.slice(1);
            return text;
        }
    }

    // --- URL ---

    const encodeForm = (s) => encodeURIComponent(s)
        .replace(/%20/g, "+")
        .replace(/[!'()~]/g, (c) => "%" + c.charCodeAt(0).toString(16).toUpperCase());
    const decodeForm = (s) => {
        try {
            return decodeURIComponent(s.replace(/\+/g, " "));
        } catch {
            return s;
        }
    };
    const kOnChange = Symbol("onChange");
    const kReset = Symbol("reset");

    class URLSearchParams {
        #list = [];
        [kOnChange] = null;
        constructor(init = "") {
            if (init instanceof URLSearchParams) {
                for (const [k, v] of init) this.#list.push([k, v]);
            } else if (init && typeof init === "object") {
                if (typeof init[Symbol.iterator] === "function") {
                    for (const pair of init) {
                        const [k, v] = pair;
                        this.#list.push([String(k), String(v)]);
                    }
                } else {
                    for (const k of Object.keys(init)) this.#list.push([k, String(init[k])]);
                }
            } else {
                this[kReset](String(init));
            }
        }
        [kReset](query) {
            this.#list = [];
            const s = query.startsWith("?") ? query.slice(1) : query;
            for (const part of s.split("&")) {
                if (!part) continue;
                const eq = part.indexOf("=");
                const k = eq < 0 ? part : part.slice(0, eq);
                const v = eq < 0 ? "" : part.slice(eq + 1);
                this.#list.push([decodeForm(k), decodeForm(v)]);
            }
        }
        #changed() {
            if (this[kOnChange]) this[kOnChange](this.toString());
        }
        get size() { return this.#list.length; }
        append(name, value) {
            this.#list.push([String(name), String(value)]);
            this.#changed();
        }
        delete(name) {
            name = String(name);
            this.#list = this.#list.filter(([k]) => k !== name);
            this.#changed();
        }
        get(name) {
            name = String(name);
            const entry = this.#list.find(([k]) => k === name);
            return entry ? entry[1] : null;
        }
        getAll(name) {
            name = String(name);
            return this.#list.filter(([k]) => k === name).map(([, v]) => v);
        }
        has(name) {
            name = String(name);
            return this.#list.some(([k]) => k === name);
        }
        set(name, value) {
            name = String(name);
            value = String(value);
            const first = this.#list.findIndex(([k]) => k === name);
            if (first < 0) {
                this.#list.push([name, value]);
            } else {
                this.#list[first] = [name, value];
                this.#list = this.#list.filter(([k], i) => k !== name || i === first);
            }
            this.#changed();
        }
        sort() {
            this.#list.sort((a, b) => (a[0] < b[0] ? -1 : a[0] > b[0] ? 1 : 0));
            this.#changed();
        }
        forEach(callback, thisArg) {
            for (const [k, v] of this.#list) callback.call(thisArg, v, k, this);
        }
        keys() { return this.#list.map(([k]) => k)[Symbol.iterator](); }
        values() { return this.#list.map(([, v]) => v)[Symbol.iterator](); }
        entries() { return this.#list.map(([k, v]) => [k, v])[Symbol.iterator](); }
        [Symbol.iterator]() { return this.entries(); }
        toString() {
            return this.#list.map(([k, v]) => `${encodeForm(k)}=${encodeForm(v)}`).join("&");
        }
    }

    class URL {
        #parts;
        #params = null;
        constructor(url, base) {
            const href = url instanceof URL ? url.href : String(url);
            const baseHref = base === undefined ? null : (base instanceof URL ? base.href : String(base));
            this.#parts = JSON.parse(ops.op_runner_url_parse(href, baseHref));
        }
        static canParse(url, base) {
            try {
                new URL(url, base);
                return true;
            } catch {
                return false;
            }
        }
        #set(part, value) {
            this.#parts = JSON.parse(ops.op_runner_url_set(this.#parts.href, part, String(value)));
            if (this.#params) this.#params[kReset](this.#parts.search);
        }
        get href() { return this.#parts.href; }
        set href(v) { this.#set("href", v); }
        get origin() { return this.#parts.origin; }
        get protocol() { return this.#parts.protocol; }
        set protocol(v) { this.#set("protocol", v); }
        get username() { return this.#parts.username; }
        set username(v) { this.#set("username", v); }
        get password() { return this.#parts.password; }
        set password(v) { this.#set("password", v); }
        get host() { return this.#parts.host; }
        set host(v) {
            const s = String(v);
            const colon = s.lastIndexOf(":");
            if (colon > 0 && !s.endsWith("]")) {
                this.#set("hostname", s.slice(0, colon));
                this.#set("port", s.slice(colon + 1));
            } else {
                this.#set("hostname", s);
            }
        }
        get hostname() { return this.#parts.hostname; }
        set hostname(v) { this.#set("hostname", v); }
        get port() { return this.#parts.port; }
        set port(v) { this.#set("port", v); }
        get pathname() { return this.#parts.pathname; }
        set pathname(v) { this.#set("pathname", v); }
        get search() { return this.#parts.search; }
        set search(v) { this.#set("search", v); }
        get hash() { return this.#parts.hash; }
        set hash(v) { this.#set("hash", v); }
        get searchParams() {
            if (!this.#params) {
                this.#params = new URLSearchParams(this.#parts.search);
                this.#params[kOnChange] = (query) => {
                    this.#parts = JSON.parse(ops.op_runner_url_set(this.#parts.href, "search", query));
                };
            }
            return this.#params;
        }
        toString() { return this.#parts.href; }
        toJSON() { return this.#parts.href; }
    }

    // --- fetch ---

    const normalizeHeaders = (headers) => {
        const out = {};
        if (!headers) return out;
        if (Array.isArray(headers)) {
            for (const [k, v] of headers) out[String(k).toLowerCase()] = String(v);
        } else if (typeof headers.forEach === "function") {
            headers.forEach((v, k) => { out[String(k).toLowerCase()] = String(v); });
        } else {
            for (const k of Object.keys(headers)) out[k.toLowerCase()] = String(headers[k]);
        }
        return out;
    };

    const makeHeaders = (raw) => Object.freeze({
        get: (name) => {
            const v = raw[String(name).toLowerCase()];
            return v === undefined ? null : v;
        },
        has: (name) => Object.prototype.hasOwnProperty.call(raw, String(name).toLowerCase()),
        forEach: (callback, thisArg) => {
            for (const k of Object.keys(raw)) callback.call(thisArg, raw[k], k);
        },
        keys: () => Object.keys(raw)[Symbol.iterator](),
        values: () => Object.values(raw)[Symbol.iterator](),
        entries: () => Object.entries(raw)[Symbol.iterator](),
        [Symbol.iterator]: () => Object.entries(raw)[Symbol.iterator](),
    });

    const makeResponse = (raw) => {
        let used = false;
        const consume = () => {
            if (used) return Promise.reject(new TypeError("Body has already been consumed"));
            used = true;
            return Promise.resolve(raw.body);
        };
        return Object.freeze({
            status: raw.status,
            statusText: raw.statusText,
            ok: raw.status >= 200 && raw.status < 300,
            url: raw.url,
            redirected: raw.redirected,
            headers: makeHeaders(raw.headers),
            get bodyUsed() { return used; },
            text: () => consume(),
            json: () => consume().then((text) => JSON.parse(text)),
            arrayBuffer: () => consume().then((text) => ops.op_runner_text_encode(text).buffer),
        });
    };

    const fetch = async (input, init = {}) => {
        const url = typeof input === "string"
            ? input
            : input instanceof URL ? input.href : String((input && input.url) || input);
        const options = init || {};
        const method = String(options.method || "GET").toUpperCase();
        const headers = normalizeHeaders(options.headers);
        let body = options.body;
        if (body === undefined || body === null) {
            body = null;
        } else if (body instanceof URLSearchParams) {
            if (!("content-type" in headers)) {
                headers["content-type"] = "application/x-www-form-urlencoded;charset=UTF-8";
            }
            body = body.toString();
        } else if (body instanceof ArrayBuffer || ArrayBuffer.isView(body)) {
            body = new TextDecoder().decode(body);
        } else if (typeof body !== "string") {
            body = JSON.stringify(body);
            if (!("content-type" in headers)) headers["content-type"] = "application/json";
        }
        const raw = await ops.op_runner_fetch(url, method, JSON.stringify(headers), body);
        return makeResponse(JSON.parse(raw));
    };

    // --- workspace API ---

    const apiRequest = async (method, path, body) => {
        const raw = await ops.op_runner_api_request(
            String(method).toUpperCase(),
            String(path),
            body === undefined ? null : JSON.stringify(body),
        );
        return JSON.parse(raw);
    };
    const plane = Object.freeze({
        workspaceSlug: data.workspaceSlug,
        request: apiRequest,
        get: (path) => apiRequest("GET", path),
        post: (path, body) => apiRequest("POST", path, body),
        put: (path, body) => apiRequest("PUT", path, body),
        patch: (path, body) => apiRequest("PATCH", path, body),
        delete: (path) => apiRequest("DELETE", path),
    });

    // --- helpers ---

    const functions = {};
    let sealed = false;
    const unavailable = (name, reason) => () => {
        throw new Error(`Function '${name}' is unavailable: ${reason}`);
    };
    const describe = (err) => (err && err.message ? err.message : String(err));

    const defineFunction = (name, factory) => {
        if (sealed) return;
        let fn;
        try {
            fn = factory(fetch);
        } catch (err) {
            functions[name] = unavailable(name, describe(err));
            return;
        }
        functions[name] = typeof fn === "function"
            ? fn
            : unavailable(name, `code does not define a function named '${name}'`);
    };
    const defineBroken = (name, reason) => {
        if (!sealed) functions[name] = unavailable(name, reason);
    };
    const sealFunctions = () => {
        if (sealed) return;
        sealed = true;
        bind("Functions", Object.freeze(functions));
    };

    // --- globals ---

    const EVENT = deepFreeze(data.event);
    const VARIABLES = deepFreeze(data.variables);

    expose("console", console);
    expose("setTimeout", (cb, ms, ...args) => schedule(cb, ms, args, false));
    expose("setInterval", (cb, ms, ...args) => schedule(cb, ms, args, true));
    expose("clearTimeout", clearTimer);
    expose("clearInterval", clearTimer);
    if (typeof realGlobal.queueMicrotask !== "function") {
        expose("queueMicrotask", (cb) => {
            Promise.resolve().then(cb).catch((err) => log("error", ["Uncaught error in microtask:", err]));
        });
    }
    expose("btoa", btoa);
    expose("atob", atob);
    expose("TextEncoder", TextEncoder);
    expose("TextDecoder", TextDecoder);
    expose("URL", URL);
    expose("URLSearchParams", URLSearchParams);

    bind("event", EVENT);
    bind("variables", VARIABLES);
    bind("env", deepFreeze(data.env));
    bind("fetch", fetch);
    bind("plane", plane);
    bind("global", Object.freeze({}));

    // --- entry point ---

    const errorData = (err) => {
        if (err instanceof Error) {
            return { message: String(err.message), stack: typeof err.stack === "string" ? err.stack : undefined };
        }
        if (err && typeof err === "object" && "message" in err) return { message: String(err.message) };
        return { message: String(err) };
    };
    const setResult = (envelope) => ops.op_runner_set_result(JSON.stringify(envelope));

    let invoked = false;
    const invoke = () => {
        if (invoked) return;
        invoked = true;
        // the IIFE bundle reassigns the global `globalThis` binding to its exports
        const entry = typeof main === "function"
            ? main
            : (globalThis && typeof globalThis.main === "function" ? globalThis.main : undefined);
        if (!entry) {
            setResult({ missing_entry: true });
            return;
        }
        Promise.resolve()
            .then(() => entry(EVENT, VARIABLES))
            .then((value) => {
                let json;
                try {
                    json = JSON.stringify({ ok: value === undefined ? null : value });
                } catch (err) {
                    json = JSON.stringify({ error: { message: `Result is not JSON-serializable: ${describe(err)}` } });
                }
                ops.op_runner_set_result(json);
            }, (err) => setResult({ error: errorData(err) }));
    };

    // --- lockdown ---

    delete realGlobal.Deno;
    delete realGlobal.eval;
    delete realGlobal.WebAssembly;
    const AsyncFunction = (async function () {}).constructor;
    const GeneratorFunction = (function* () {}).constructor;
    Object.defineProperty(Function.prototype, "constructor", {
        value: undefined, configurable: false, writable: false,
    });
    Object.defineProperty(AsyncFunction.prototype, "constructor", {
        value: undefined, configurable: false, writable: false,
    });
    Object.defineProperty(GeneratorFunction.prototype, "constructor", {
        value: undefined, configurable: false, writable: false,
    });

    return Object.freeze({ defineFunction, defineBroken, sealFunctions, invoke });
}"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        for ok in ["getIssue", "_private", "$el", "fn2"] {
            assert!(is_valid_identifier(ok), "{ok}");
        }
        for bad in ["", "2fn", "get-issue", "a b", "x;alert(1)", "ünï"] {
            assert!(!is_valid_identifier(bad), "{bad}");
        }
    }

    #[test]
    fn helper_script_returns_named_binding() {
        let f = ScriptFunction {
            name: "double".into(),
            code: "function double(x) { return x * 2; }".into(),
            ..Default::default()
        };
        let script = helper_script(&f).unwrap();
        assert!(script.starts_with("__runnerHost.defineFunction(\"double\", (function (fetch) {"));
        assert!(script.contains("function double(x) { return x * 2; }\n;"));
        assert!(script.contains("typeof double === \"function\" ? double : undefined"));
    }

    #[test]
    fn broken_helper_reason_is_json_escaped() {
        let script = broken_helper_script("f", "Use of \"require\" is not allowed").unwrap();
        assert_eq!(
            script,
            r#"__runnerHost.defineBroken("f", "Use of \"require\" is not allowed");"#
        );
    }

    #[test]
    fn bootstrap_embeds_context_as_json() {
        let ctx = ExecutionContext {
            workspace_slug: "acme".into(),
            input: json!({"event": {"type": "issue.created"}}),
            access_token: "secret-token".into(),
            ..Default::default()
        };
        let script = build_bootstrap(&ctx).unwrap();
        assert!(script.starts_with("const __runnerHost = ("));
        assert!(script.contains("(Deno.core.ops, {"));
        assert!(script.contains(r#""event":{"event":{"type":"issue.created"}}"#));
        assert!(script.contains(r#""workspaceSlug":"acme""#));
        assert!(!script.contains("secret-token"));
    }
}
