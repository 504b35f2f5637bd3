use std::path::Path;

use chrono::Utc;
use serde_json::Value;

use colloquy_core::tools::ToolDefinition;
use colloquy_llm::Capabilities;

pub const BASE_PROMPT: &str = include_str!("../prompts/system.txt");
pub const SUMMARY_PROMPT: &str = include_str!("../prompts/summarize.txt");
pub const TITLE_PROMPT: &str = include_str!("../prompts/title.txt");

/// Cap on generated session titles, in characters.
pub const TITLE_MAX_CHARS: usize = 50;

pub fn environment_block(working_directory: &Path) -> String {
    format!(
        "<env>\nworking directory: {}\nplatform: {}\ntoday: {}\n</env>",
        working_directory.display(),
        std::env::consts::OS,
        Utc::now().format("%Y-%m-%d"),
    )
}

/// System prompt blocks for one generation, fitted to the provider's block limit.
pub fn system_blocks(caps: &Capabilities, working_directory: &Path, extra: Option<&str>) -> Vec<String> {
    let mut blocks = vec![BASE_PROMPT.trim_end().to_string(), environment_block(working_directory)];
    if let Some(extra) = extra.map(str::trim).filter(|s| !s.is_empty()) {
        blocks.push(extra.to_string());
    }
    fit_blocks(blocks, caps.max_system_blocks)
}

/// Merge trailing blocks into the last permitted one.
fn fit_blocks(mut blocks: Vec<String>, max: Option<usize>) -> Vec<String> {
    let Some(max) = max.filter(|&m| m > 0) else {
        return blocks;
    };
    if blocks.len() <= max {
        return blocks;
    }
    let tail = blocks.split_off(max - 1).join("\n\n");
    blocks.push(tail);
    blocks
}

/// Tool descriptors with provider-rejected schema keys removed.
pub fn adapt_tools(mut tools: Vec<ToolDefinition>, caps: &Capabilities) -> Vec<ToolDefinition> {
    if caps.strip_schema_keys.is_empty() {
        return tools;
    }
    for tool in &mut tools {
        strip_keys(&mut tool.parameters_schema, caps.strip_schema_keys);
    }
    tools
}

fn strip_keys(value: &mut Value, keys: &[&str]) {
    match value {
        Value::Object(map) => {
            map.retain(|k, _| !keys.contains(&k.as_str()));
            for v in map.values_mut() {
                strip_keys(v, keys);
            }
        }
        Value::Array(items) => {
            for v in items {
                strip_keys(v, keys);
            }
        }
        _ => {}
    }
}

/// First non-empty line of a model reply, trimmed to [`TITLE_MAX_CHARS`].
pub fn clean_title(reply: &str) -> Option<String> {
    let line = reply.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.trim_matches(|c| c == '"' || c == '\'');
    if line.is_empty() {
        return None;
    }
    Some(line.chars().take(TITLE_MAX_CHARS).collect())
}
