//! AST-based security validator for automation scripts.
//!
//! Parses the script with `oxc_parser` and walks the whole tree once. Each
//! rule is a pure predicate over a single node kind; the walk folds every
//! violation into an ordered, deduplicated list. The V8 isolate remains the
//! real boundary, this pass rejects the obvious escapes before a build is
//! ever started and gives the author readable messages.

use std::collections::HashSet;
use std::sync::LazyLock;

use oxc_allocator::Allocator;
use oxc_ast::ast::*;
use oxc_ast::visit::walk;
use oxc_ast::Visit;
use oxc_parser::{ParseOptions, Parser};
use oxc_span::SourceType;
use regex::Regex;
use serde::Serialize;

/// Default maximum source size in bytes (1 MiB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 1024 * 1024;

/// Maximum bracket nesting depth. Deeper input is rejected before parsing.
const MAX_NESTING_DEPTH: usize = 256;

/// Identifiers whose mere reference is rejected.
const BLOCKED_IDENTIFIERS: &[&str] = &[
    "require",
    "module",
    "exports",
    "__dirname",
    "__filename",
];

/// Built-in modules with filesystem, network, process or VM reach.
const SENSITIVE_MODULES: &[&str] = &[
    "fs",
    "net",
    "tls",
    "dgram",
    "dns",
    "http2",
    "child_process",
    "cluster",
    "vm",
    "worker_threads",
    "v8",
    "inspector",
    "repl",
];

/// Extra module specifiers rejected in `import` / `export ... from`.
const SENSITIVE_IMPORT_ONLY: &[&str] = &["os", "process", "module", "http", "https"];

const BLOCKED_PROCESS_MEMBERS: &[&str] = &[
    "exit",
    "kill",
    "abort",
    "chdir",
    "dlopen",
    "binding",
    "_linkedBinding",
    "reallyExit",
    "setuid",
    "setgid",
    "seteuid",
    "setegid",
    "setgroups",
    "initgroups",
    "umask",
];

const BLOCKED_PROPERTIES: &[&str] = &["__proto__", "constructor", "prototype"];

static FUNCTIONS_USAGE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"Functions\.(\w+)").ok());

/// Outcome of validating one script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    /// `true` iff there are no violations.
    pub valid: bool,
    /// Human-readable violations in first-seen order, without duplicates.
    #[serde(rename = "errors", skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
}

impl ValidationResult {
    /// A passing result.
    pub fn ok() -> Self {
        Self {
            valid: true,
            violations: Vec::new(),
        }
    }

    /// Build a result from raw violations, deduplicating by exact text.
    pub fn from_violations(violations: Vec<String>) -> Self {
        let mut seen = HashSet::new();
        let violations: Vec<String> = violations
            .into_iter()
            .filter(|v| seen.insert(v.clone()))
            .collect();
        Self {
            valid: violations.is_empty(),
            violations,
        }
    }

    fn single(violation: impl Into<String>) -> Self {
        Self::from_violations(vec![violation.into()])
    }
}

/// Validate a script with the default size limit.
pub fn validate(code: &str) -> ValidationResult {
    validate_code(code, None)
}

/// Validate a script. Never panics; every problem becomes a violation.
pub fn validate_code(code: &str, max_size: Option<usize>) -> ValidationResult {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if code.trim().is_empty() {
        return ValidationResult::single("code is empty");
    }
    if code.len() > max {
        return ValidationResult::single(format!(
            "code exceeds maximum size of {max} bytes (got {})",
            code.len()
        ));
    }
    if let Err(violation) = check_nesting_depth(code) {
        return ValidationResult::single(violation);
    }

    ValidationResult::from_violations(scan(code, module_source_type()))
}

fn module_source_type() -> SourceType {
    SourceType::default()
        .with_module(true)
        .with_typescript(true)
}

fn parse_options() -> ParseOptions {
    ParseOptions {
        allow_return_outside_function: true,
        ..ParseOptions::default()
    }
}

#[derive(Clone, Copy)]
enum Lex {
    Code,
    Quoted(u8),
    Template,
    LineComment,
    BlockComment,
}

/// Check nesting depth of brackets/braces/parens before parsing.
///
/// String, template and comment text is skipped; `${` inside a template
/// counts as one level and its matching `}` resumes the template.
fn check_nesting_depth(code: &str) -> Result<(), String> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    // depth of each open `${` substitution
    let mut substitutions: Vec<usize> = Vec::new();
    let mut mode = Lex::Code;
    let mut bytes = code.bytes().peekable();

    while let Some(b) = bytes.next() {
        match mode {
            Lex::Code => match b {
                b'{' | b'[' | b'(' => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                }
                b'}' if substitutions.last() == Some(&depth) => {
                    substitutions.pop();
                    depth -= 1;
                    mode = Lex::Template;
                }
                b'}' | b']' | b')' => depth = depth.saturating_sub(1),
                b'"' | b'\'' => mode = Lex::Quoted(b),
                b'`' => mode = Lex::Template,
                b'/' if bytes.peek() == Some(&b'/') => {
                    bytes.next();
                    mode = Lex::LineComment;
                }
                b'/' if bytes.peek() == Some(&b'*') => {
                    bytes.next();
                    mode = Lex::BlockComment;
                }
                _ => {}
            },
            Lex::Quoted(quote) => match b {
                b'\\' => {
                    bytes.next();
                }
                // unterminated literal, left for the parser to report
                b'\n' => mode = Lex::Code,
                _ if b == quote => mode = Lex::Code,
                _ => {}
            },
            Lex::Template => match b {
                b'\\' => {
                    bytes.next();
                }
                b'`' => mode = Lex::Code,
                b'$' if bytes.peek() == Some(&b'{') => {
                    bytes.next();
                    depth += 1;
                    max_depth = max_depth.max(depth);
                    substitutions.push(depth);
                    mode = Lex::Code;
                }
                _ => {}
            },
            Lex::LineComment => {
                if b == b'\n' {
                    mode = Lex::Code;
                }
            }
            Lex::BlockComment => {
                if b == b'*' && bytes.peek() == Some(&b'/') {
                    bytes.next();
                    mode = Lex::Code;
                }
            }
        }
    }
    if max_depth > MAX_NESTING_DEPTH {
        return Err(format!(
            "nesting depth {max_depth} exceeds maximum {MAX_NESTING_DEPTH}"
        ));
    }
    Ok(())
}

/// Parse with the given goal and collect raw (not yet deduplicated) violations.
pub(crate) fn scan(code: &str, source_type: SourceType) -> Vec<String> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, code, source_type)
        .with_options(parse_options())
        .parse();

    if ret.panicked || !ret.errors.is_empty() {
        let first = ret
            .errors
            .first()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "parser could not recover".into());
        return vec![format!("Syntax error: {first}")];
    }

    let mut rules = RuleVisitor::default();
    rules.visit_program(&ret.program);
    rules.violations
}

/// Full-tree visitor applying every rule at the node kind it inspects.
#[derive(Default)]
struct RuleVisitor {
    violations: Vec<String>,
}

impl RuleVisitor {
    fn report(&mut self, violation: Option<String>) {
        if let Some(v) = violation {
            self.violations.push(v);
        }
    }
}

impl<'a> Visit<'a> for RuleVisitor {
    fn visit_identifier_reference(&mut self, it: &IdentifierReference<'a>) {
        self.report(blocked_identifier(it.name.as_str()));
    }

    fn visit_call_expression(&mut self, it: &CallExpression<'a>) {
        self.report(dynamic_code_callee(&it.callee));
        self.report(string_timer(&it.callee, &it.arguments));
        walk::walk_call_expression(self, it);
    }

    fn visit_new_expression(&mut self, it: &NewExpression<'a>) {
        self.report(dynamic_code_callee(&it.callee));
        walk::walk_new_expression(self, it);
    }

    fn visit_static_member_expression(&mut self, it: &StaticMemberExpression<'a>) {
        self.report(dangerous_member(&it.object, it.property.name.as_str()));
        walk::walk_static_member_expression(self, it);
    }

    fn visit_computed_member_expression(&mut self, it: &ComputedMemberExpression<'a>) {
        if let Some(prop) = static_string(&it.expression) {
            self.report(dangerous_member(&it.object, prop));
        }
        walk::walk_computed_member_expression(self, it);
    }

    fn visit_while_statement(&mut self, it: &WhileStatement<'a>) {
        if is_true_literal(&it.test) {
            self.report(Some("Infinite loop detected: while (true)".into()));
        }
        walk::walk_while_statement(self, it);
    }

    fn visit_for_statement(&mut self, it: &ForStatement<'a>) {
        if it.test.as_ref().map_or(true, is_true_literal) {
            self.report(Some("Infinite loop detected: for loop without exit condition".into()));
        }
        walk::walk_for_statement(self, it);
    }

    fn visit_with_statement(&mut self, it: &WithStatement<'a>) {
        self.report(Some("'with' statements are not allowed".into()));
        walk::walk_with_statement(self, it);
    }

    fn visit_import_expression(&mut self, it: &ImportExpression<'a>) {
        self.report(Some("Dynamic import() is not allowed".into()));
        walk::walk_import_expression(self, it);
    }

    fn visit_import_declaration(&mut self, it: &ImportDeclaration<'a>) {
        self.report(sensitive_import(it.source.value.as_str()));
        walk::walk_import_declaration(self, it);
    }

    fn visit_export_all_declaration(&mut self, it: &ExportAllDeclaration<'a>) {
        self.report(sensitive_import(it.source.value.as_str()));
        walk::walk_export_all_declaration(self, it);
    }

    fn visit_export_named_declaration(&mut self, it: &ExportNamedDeclaration<'a>) {
        if let Some(source) = &it.source {
            self.report(sensitive_import(source.value.as_str()));
        }
        walk::walk_export_named_declaration(self, it);
    }
}

// --- Rules ---

fn blocked_identifier(name: &str) -> Option<String> {
    if BLOCKED_IDENTIFIERS.contains(&name) {
        return Some(format!("Use of '{name}' is not allowed"));
    }
    if SENSITIVE_MODULES.contains(&name) {
        return Some(format!("Access to built-in module '{name}' is not allowed"));
    }
    None
}

fn dynamic_code_callee(callee: &Expression<'_>) -> Option<String> {
    match strip_parens(callee) {
        Expression::Identifier(ident) => match ident.name.as_str() {
            "eval" => Some("Dynamic code execution via eval() is not allowed".into()),
            "Function" => {
                Some("Dynamic code execution via the Function constructor is not allowed".into())
            }
            _ => None,
        },
        _ => None,
    }
}

fn string_timer(callee: &Expression<'_>, arguments: &[Argument<'_>]) -> Option<String> {
    let Expression::Identifier(ident) = strip_parens(callee) else {
        return None;
    };
    let name = ident.name.as_str();
    if name != "setTimeout" && name != "setInterval" {
        return None;
    }
    let is_string = match arguments.first() {
        Some(Argument::StringLiteral(_)) => true,
        Some(Argument::TemplateLiteral(t)) => t.expressions.is_empty(),
        _ => false,
    };
    is_string.then(|| format!("{name}() with a string argument is not allowed"))
}

fn dangerous_member(object: &Expression<'_>, property: &str) -> Option<String> {
    if BLOCKED_PROPERTIES.contains(&property) {
        return Some(format!("Access to '{property}' is not allowed"));
    }
    if let Expression::Identifier(obj) = strip_parens(object) {
        if obj.name.as_str() == "process" && BLOCKED_PROCESS_MEMBERS.contains(&property) {
            return Some(format!("Access to process.{property} is not allowed"));
        }
    }
    None
}

fn sensitive_import(specifier: &str) -> Option<String> {
    let bare = specifier.strip_prefix("node:").unwrap_or(specifier);
    let root = bare.split('/').next().unwrap_or(bare);
    if SENSITIVE_MODULES.contains(&root) || SENSITIVE_IMPORT_ONLY.contains(&root) {
        return Some(format!("Import of built-in module '{specifier}' is not allowed"));
    }
    None
}

// --- Helpers ---

fn strip_parens<'b, 'a>(mut expr: &'b Expression<'a>) -> &'b Expression<'a> {
    while let Expression::ParenthesizedExpression(p) = expr {
        expr = &p.expression;
    }
    expr
}

fn is_true_literal(expr: &Expression<'_>) -> bool {
    matches!(strip_parens(expr), Expression::BooleanLiteral(b) if b.value)
}

/// The compile-time string value of a bracket key: `"x"` or `` `x` ``.
fn static_string<'b>(expr: &'b Expression<'_>) -> Option<&'b str> {
    match strip_parens(expr) {
        Expression::StringLiteral(s) => Some(s.value.as_str()),
        Expression::TemplateLiteral(t) if t.expressions.is_empty() => {
            t.quasis.first().map(|q| q.value.raw.as_str())
        }
        _ => None,
    }
}

// --- Function-name detection ---

/// Names `N` referenced as `Functions.N`, distinct, in first-seen order.
///
/// Falls back to a regex scan when the source does not parse.
pub fn detect_function_names(code: &str) -> Vec<String> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, code, module_source_type())
        .with_options(parse_options())
        .parse();

    let names = if ret.panicked || !ret.errors.is_empty() {
        detect_function_names_fallback(code)
    } else {
        let mut finder = FunctionsUsage::default();
        finder.visit_program(&ret.program);
        finder.names
    };

    let mut seen = HashSet::new();
    names.into_iter().filter(|n| seen.insert(n.clone())).collect()
}

fn detect_function_names_fallback(code: &str) -> Vec<String> {
    let Some(re) = FUNCTIONS_USAGE.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(code)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

#[derive(Default)]
struct FunctionsUsage {
    names: Vec<String>,
}

impl<'a> Visit<'a> for FunctionsUsage {
    fn visit_static_member_expression(&mut self, it: &StaticMemberExpression<'a>) {
        if let Expression::Identifier(obj) = &it.object {
            if obj.name.as_str() == "Functions" {
                self.names.push(it.property.name.to_string());
            }
        }
        walk::walk_static_member_expression(self, it);
    }
}
