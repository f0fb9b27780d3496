use std::collections::HashMap;

/// The parsed contents of an `ssr.conf` file.
#[derive(Debug, Default)]
pub struct SsrConfigFile {
    /// Top-level `key value;` directives (e.g., `listen`, `allow_cookies`)
    pub directives: HashMap<String, String>,
    /// The `cache { ... }` block, if present
    pub cache: Option<CacheBlock>,
    /// `proxy name { ... }` blocks in declaration order
    pub proxies: Vec<ProxyBlock>,
}

/// Represents the `cache { ... }` block.
#[derive(Debug, Default)]
pub struct CacheBlock {
    pub directives: HashMap<String, String>,
}

/// Represents a `proxy name { ... }` block. The name doubles as the route
/// segment unless a `path` directive overrides it.
#[derive(Debug, Default)]
pub struct ProxyBlock {
    pub name: String,
    pub host: Option<String>,
    pub protocol: Option<String>,
    pub path: Option<String>,
}

/// A small parser for the nginx-like `ssr.conf` syntax.
///
/// Every directive is `key value;`, blocks are `cache { ... }` and
/// `proxy name { ... }`, `#` starts a comment. Any structural problem
/// (missing semicolon, unbalanced braces, unknown block) is an error.
pub fn parse_ssr_config(input: &str) -> Result<SsrConfigFile, String> {
    let tokens = tokenize(input);
    let mut config = SsrConfigFile::default();
    let mut i = 0;

    while i < tokens.len() {
        let token = tokens[i].as_str();

        // Parse: `cache { ... }`
        if token == "cache" && tokens.get(i + 1).map(String::as_str) == Some("{") {
            if config.cache.is_some() {
                return Err("duplicate 'cache' block".to_string());
            }
            let (directives, new_i) = parse_directive_block(&tokens, i + 2, "cache")?;
            config.cache = Some(CacheBlock { directives });
            i = new_i;
            continue;
        }

        // Parse: `proxy name { ... }`
        if token == "proxy" {
            let name = tokens
                .get(i + 1)
                .filter(|t| !is_structural(t))
                .ok_or("'proxy' needs a name")?
                .clone();
            if tokens.get(i + 2).map(String::as_str) != Some("{") {
                return Err(format!("expected '{{' after 'proxy {}'", name));
            }
            let (mut directives, new_i) =
                parse_directive_block(&tokens, i + 3, &format!("proxy {}", name))?;
            config.proxies.push(ProxyBlock {
                name,
                host: directives.remove("host"),
                protocol: directives.remove("protocol"),
                path: directives.remove("path"),
            });
            if let Some(unknown) = directives.keys().next() {
                return Err(format!("unknown proxy directive '{}'", unknown));
            }
            i = new_i;
            continue;
        }

        let (key, value, new_i) = parse_directive(&tokens, i)?;
        config.directives.insert(key, value);
        i = new_i;
    }

    Ok(config)
}

fn is_structural(token: &str) -> bool {
    matches!(token, "{" | "}" | ";")
}

/// Parses `key value;` at `i`.
fn parse_directive(tokens: &[String], i: usize) -> Result<(String, String, usize), String> {
    let key = &tokens[i];
    if is_structural(key) {
        return Err(format!("unexpected '{}'", key));
    }
    match (tokens.get(i + 1), tokens.get(i + 2)) {
        (Some(value), Some(semi)) if !is_structural(value) && semi == ";" => {
            Ok((key.clone(), value.clone(), i + 3))
        }
        (Some(value), _) if value == "{" => Err(format!("unknown block '{}'", key)),
        _ => Err(format!("directive '{}' must be 'key value;'", key)),
    }
}

/// Parses directives up to the closing brace of a block.
fn parse_directive_block(
    tokens: &[String],
    mut i: usize,
    block: &str,
) -> Result<(HashMap<String, String>, usize), String> {
    let mut directives = HashMap::new();
    while i < tokens.len() {
        if tokens[i] == "}" {
            return Ok((directives, i + 1));
        }
        let (key, value, new_i) = parse_directive(tokens, i)?;
        directives.insert(key, value);
        i = new_i;
    }
    Err(format!("unterminated '{}' block", block))
}

/// Basic lexical scanner that breaks a raw configuration string into semantic tokens.
/// Accounts for whitespace separation and specific control characters (`{`, `}`, `;`).
/// Also handles string literals wrapped in quotes (single or double) and `#` comments.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current_token = String::new();
    let mut in_quotes = false;
    let mut in_comment = false;

    for c in input.chars() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            continue;
        }

        // Toggle quote state to capture strings with embedded spaces
        if c == '"' || c == '\'' {
            in_quotes = !in_quotes;
            continue;
        }

        if in_quotes {
            current_token.push(c);
            continue;
        }

        if c == '#' {
            in_comment = true;
            continue;
        }

        // Whitespace acts as a token delimiter
        if c.is_whitespace() {
            if !current_token.is_empty() {
                tokens.push(std::mem::take(&mut current_token));
            }
            continue;
        }

        // Structural characters are their own immediate tokens
        if is_structural(c.encode_utf8(&mut [0; 4])) {
            if !current_token.is_empty() {
                tokens.push(std::mem::take(&mut current_token));
            }
            tokens.push(c.to_string());
            continue;
        }

        current_token.push(c);
    }

    if !current_token.is_empty() {
        tokens.push(current_token);
    }

    tokens
}
