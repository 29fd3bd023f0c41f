//! Syntax Guard：执行前的启发式检查与自动修复
//!
//! 只处理少数几种可机械修复的生成错误：
//! - 单行 `.map(x => { key: value })` 缺少 return → 改写为 `{ return { key: value }; }`
//! - 整行孤立的 `{ key: value }` 语句 → 注释掉并标注
//! - 顶层 `return expr;` → `expr;`，`return { ... }` → `({ ... });`
//!
//! 拿不准的代码原样放行，交给解释器自己报错。

use std::sync::OnceLock;

use regex::Regex;

use crate::core::BotError;

/// 回调块向下扫描的最大行数
const MAP_BLOCK_SCAN_LINES: usize = 10;

static MAP_BODY_RE: OnceLock<Regex> = OnceLock::new();
static STANDALONE_OBJECT_RE: OnceLock<Regex> = OnceLock::new();
static KEY_COLON_RE: OnceLock<Regex> = OnceLock::new();

fn map_body_re() -> &'static Regex {
    MAP_BODY_RE.get_or_init(|| {
        Regex::new(r"(\.map\([^)\n]*=>[ \t]*)\{[ \t]*([^{}\n]+?)[ \t]*\}").unwrap()
    })
}

fn standalone_object_re() -> &'static Regex {
    STANDALONE_OBJECT_RE.get_or_init(|| Regex::new(r"^\s*\{[^{}]*:[^{}]*\}\s*;?\s*$").unwrap())
}

/// 以 `key:` / `"key":` 开头的行（对象字面量属性）
fn key_colon_re() -> &'static Regex {
    KEY_COLON_RE.get_or_init(|| {
        Regex::new(r#"^\s*(?:[A-Za-z_$][\w$]*|"[^"]*"|'[^']*')\s*:"#).unwrap()
    })
}

/// 检查结果：修复后的代码 + 做过的修复
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardReport {
    pub code: String,
    pub fixes: Vec<String>,
}

impl GuardReport {
    pub fn changed(&self) -> bool {
        !self.fixes.is_empty()
    }
}

/// 先修复，再对修复后的代码做结构检查；发现无法修复的问题返回 Syntax
pub fn check(code: &str) -> Result<GuardReport, BotError> {
    let mut fixes = Vec::new();
    let code = fix_map_bodies(code, &mut fixes);
    let code = fix_standalone_objects(&code, &mut fixes);
    let code = strip_top_level_return_with(&code, &mut fixes);

    let problems = validate(&code);
    if !problems.is_empty() {
        return Err(BotError::Syntax(problems.join("; ")));
    }
    if !fixes.is_empty() {
        tracing::debug!(fixes = ?fixes, "Syntax guard repaired generated code");
    }
    Ok(GuardReport { code, fixes })
}

/// 只做顶层 return 改写（沙箱执行前总会调用）
pub fn strip_top_level_return(code: &str) -> String {
    strip_top_level_return_with(code, &mut Vec::new())
}

fn fix_map_bodies(code: &str, fixes: &mut Vec<String>) -> String {
    map_body_re()
        .replace_all(code, |caps: &regex::Captures<'_>| {
            let prefix = &caps[1];
            let body = caps[2].trim();
            let is_bare_object = body.contains(':')
                && !body.contains(';')
                && !body.contains("return")
                && key_colon_re().is_match(body);
            if is_bare_object {
                fixes.push(format!("added return to map callback: {body}"));
                format!("{prefix}{{ return {{ {body} }}; }}")
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

fn fix_standalone_objects(code: &str, fixes: &mut Vec<String>) -> String {
    let mut out = Vec::new();
    for line in code.lines() {
        let trimmed = line.trim();
        if standalone_object_re().is_match(line)
            && !trimmed.contains("return")
            && !trimmed.contains('=')
            && key_colon_re().is_match(trimmed.trim_start_matches('{'))
        {
            let indent = &line[..line.len() - line.trim_start().len()];
            fixes.push(format!("commented out standalone object: {trimmed}"));
            out.push(format!("{indent}// Fixed: {trimmed} (was standalone object)"));
        } else {
            out.push(line.to_string());
        }
    }
    join_like(code, out)
}

fn strip_top_level_return_with(code: &str, fixes: &mut Vec<String>) -> String {
    let mut depth: i64 = 0;
    // 多行 `return {` 改写后，等回到顶层时补上右括号
    let mut open_paren = false;
    let mut out = Vec::new();
    for line in code.lines() {
        let trimmed = line.trim_start();
        let at_top = depth == 0;
        depth += brace_delta(line);
        if at_top && is_return_statement(trimmed) {
            let indent = &line[..line.len() - trimmed.len()];
            let rest = trimmed["return".len()..].trim_start();
            fixes.push("removed top-level return".to_string());
            if rest.is_empty() || rest == ";" {
                out.push(format!("{indent}undefined;"));
            } else if rest.starts_with('{') {
                // 行首的 { 会被解析成代码块，对象字面量需要加括号
                if depth > 0 {
                    open_paren = true;
                    out.push(format!("{indent}({rest}"));
                } else {
                    out.push(format!("{indent}({});", trim_statement_end(rest)));
                }
            } else {
                out.push(format!("{indent}{rest}"));
            }
        } else if open_paren && depth <= 0 {
            open_paren = false;
            out.push(format!("{});", trim_statement_end(line)));
        } else {
            out.push(line.to_string());
        }
    }
    join_like(code, out)
}

fn trim_statement_end(s: &str) -> &str {
    s.trim_end().trim_end_matches(';').trim_end()
}

fn is_return_statement(trimmed: &str) -> bool {
    match trimmed.strip_prefix("return") {
        Some(rest) => rest.is_empty() || rest.starts_with([' ', '\t', ';', '(', '[', '{', '"', '\'', '`']),
        None => false,
    }
}

/// 结构检查，返回问题描述列表
fn validate(code: &str) -> Vec<String> {
    let lines: Vec<&str> = code.lines().collect();
    let mut problems = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") {
            continue;
        }

        // 多行 map 回调：块内有 key: value 却没有 return
        if (trimmed.contains(".map(") || trimmed.contains("=> {")) && trimmed.ends_with('{') {
            if let Some(block) = callback_block(&lines, i) {
                let has_return = block.iter().any(|l| l.contains("return"));
                let has_property = block.iter().any(|l| {
                    let t = l.trim();
                    !t.starts_with("case ") && !t.starts_with("default") && key_colon_re().is_match(t)
                });
                if has_property && !has_return {
                    problems.push(format!(
                        "line {}: callback body looks like an object literal but has no return",
                        i + 1
                    ));
                }
            }
        }

        // 孤立的多行对象字面量开头
        if trimmed.starts_with('{')
            && !trimmed.contains('}')
            && !trimmed.ends_with('{')
            && trimmed.contains(':')
            && !trimmed.contains("return")
            && !trimmed.contains('=')
            && !in_expression_context(&lines, i)
        {
            problems.push(format!(
                "line {}: object literal used as a statement: {trimmed}",
                i + 1
            ));
        }
    }
    problems
}

/// 从 start 行的 `{` 开始，收集块内的行（最多 MAP_BLOCK_SCAN_LINES 行）
fn callback_block<'a>(lines: &[&'a str], start: usize) -> Option<Vec<&'a str>> {
    let mut depth = brace_delta(lines[start]);
    if depth <= 0 {
        return None;
    }
    let mut block = Vec::new();
    for line in lines.iter().skip(start + 1).take(MAP_BLOCK_SCAN_LINES) {
        depth += brace_delta(line);
        if depth <= 0 {
            return Some(block);
        }
        // 只看回调体本层
        if depth == 1 || line.contains("return") {
            block.push(*line);
        }
    }
    Some(block)
}

/// 上一非空行以这些符号结尾时，下一行的 `{` 是表达式（数组元素、参数、赋值右侧）
fn in_expression_context(lines: &[&str], i: usize) -> bool {
    lines[..i]
        .iter()
        .rev()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .map(|prev| {
            prev.ends_with(['[', ',', '(', ':', '=', '?'])
                || prev.ends_with("return")
                || prev.ends_with("=>")
        })
        .unwrap_or(false)
}

/// 粗略统计一行的花括号净增量（跳过字符串与行注释）
fn brace_delta(line: &str) -> i64 {
    let mut delta = 0;
    let mut quote: Option<char> = None;
    let mut prev = '\0';
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == q && prev != '\\' {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' | '`' => quote = Some(c),
                '/' if chars.peek() == Some(&'/') => break,
                '{' => delta += 1,
                '}' => delta -= 1,
                _ => {}
            },
        }
        prev = if prev == '\\' && c == '\\' { '\0' } else { c };
    }
    delta
}

fn join_like(original: &str, lines: Vec<String>) -> String {
    let mut s = lines.join("\n");
    if original.ends_with('\n') {
        s.push('\n');
    }
    s
}
