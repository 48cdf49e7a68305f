//! Single-pass URL template engine.
//!
//! Renders a path template containing `:name` (required) and `:name?`
//! (optional) placeholders, then serializes whatever parameters the path
//! did not consume into a query string. The scanner walks the template
//! once; placeholder names are ASCII identifiers, so byte-wise scanning is
//! safe and literals are copied through as slices.
//!
//! Percent-escaping is delegated to the `percent-encoding` codec with the
//! same escape set a browser's `encodeURIComponent` uses.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::{TemplateError, ALLOWED_PARAM_TYPES};
use crate::params::{ParamValue, Params};

/// `encodeURIComponent`-compatible escape set.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// How list values are written into the query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayFormat {
    /// `codes=col,pe,at`
    Comma,
    /// `codes[0]=col&codes[1]=pe`
    Indices,
    /// `codes[]=col&codes[]=pe`
    Brackets,
    /// `codes=col&codes=pe`
    Repeat,
}

/// Query serialization options.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    pub delimiter: char,
    /// Skip `Absent` values entirely instead of writing `key=`.
    pub skip_nulls: bool,
    pub array_format: ArrayFormat,
    /// Leave keys unescaped; escape values only.
    pub encode_values_only: bool,
    /// Legacy form encoding: spaces become `+` instead of `%20`.
    pub space_as_plus: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            delimiter: '&',
            skip_nulls: true,
            array_format: ArrayFormat::Comma,
            encode_values_only: true,
            space_as_plus: true,
        }
    }
}

impl QueryOptions {
    /// Layer per-call overrides on top of these options.
    pub fn apply(&self, overrides: &QueryOverrides) -> QueryOptions {
        QueryOptions {
            delimiter: overrides.delimiter.unwrap_or(self.delimiter),
            skip_nulls: overrides.skip_nulls.unwrap_or(self.skip_nulls),
            array_format: overrides.array_format.unwrap_or(self.array_format),
            encode_values_only: overrides.encode_values_only.unwrap_or(self.encode_values_only),
            space_as_plus: overrides.space_as_plus.unwrap_or(self.space_as_plus),
        }
    }
}

/// Partial query options; unset fields inherit the instance defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOverrides {
    pub delimiter: Option<char>,
    pub skip_nulls: Option<bool>,
    pub array_format: Option<ArrayFormat>,
    pub encode_values_only: Option<bool>,
    pub space_as_plus: Option<bool>,
}

impl QueryOverrides {
    /// Layer `over` on top of `self`, field by field.
    pub fn overlay(&self, over: &QueryOverrides) -> QueryOverrides {
        QueryOverrides {
            delimiter: over.delimiter.or(self.delimiter),
            skip_nulls: over.skip_nulls.or(self.skip_nulls),
            array_format: over.array_format.or(self.array_format),
            encode_values_only: over.encode_values_only.or(self.encode_values_only),
            space_as_plus: over.space_as_plus.or(self.space_as_plus),
        }
    }
}

/// Result of path rendering: the rendered path plus every parameter the
/// template did not consume.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPath {
    pub path: String,
    pub remaining: Params,
}

/// Render the path portion of `template`.
///
/// Consumed placeholder keys are removed from a working copy of `params`;
/// the caller's map is never mutated. A `/` immediately preceding a
/// placeholder belongs to the token and vanishes with an omitted optional
/// placeholder.
pub fn render_path(template: &str, params: &Params) -> Result<RenderedPath, TemplateError> {
    let mut working = params.clone();
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    let mut literal_start = 0;

    while i < bytes.len() {
        let sep = bytes[i] == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b':';
        let colon = if sep {
            i + 1
        } else if bytes[i] == b':' {
            i
        } else {
            i += 1;
            continue;
        };

        let name_start = colon + 1;
        let mut name_end = name_start;
        while name_end < bytes.len()
            && (bytes[name_end].is_ascii_alphanumeric() || bytes[name_end] == b'_')
        {
            name_end += 1;
        }
        if name_end == name_start {
            // lone ':' is literal text
            i = colon + 1;
            continue;
        }

        out.push_str(&template[literal_start..i]);
        let name = &template[name_start..name_end];
        let optional = name_end < bytes.len() && bytes[name_end] == b'?';
        let token_end = if optional { name_end + 1 } else { name_end };

        match working.remove(name) {
            Some(value) if !matches!(value, ParamValue::Absent) => {
                let segment = path_segment(name, &value)?;
                if sep {
                    out.push('/');
                }
                out.push_str(&segment);
            }
            _ => {
                if !optional {
                    return Err(TemplateError::MissingParam { name: name.to_string() });
                }
            }
        }

        i = token_end;
        literal_start = token_end;
    }
    out.push_str(&template[literal_start..]);

    Ok(RenderedPath { path: out, remaining: working })
}

fn path_segment(name: &str, value: &ParamValue) -> Result<String, TemplateError> {
    match value {
        ParamValue::Str(s) if s.trim().is_empty() => {
            Err(TemplateError::EmptyParam { name: name.to_string() })
        }
        ParamValue::Bool(b) => Ok(b.to_string()),
        ParamValue::Int(n) => Ok(n.to_string()),
        ParamValue::Float(n) => Ok(escape(&n.to_string(), false)),
        ParamValue::Str(s) => Ok(escape(s, false)),
        other => Err(TemplateError::InvalidParamType {
            name: name.to_string(),
            actual: other.kind(),
            allowed: ALLOWED_PARAM_TYPES,
        }),
    }
}

fn escape(raw: &str, space_as_plus: bool) -> String {
    let encoded = utf8_percent_encode(raw, COMPONENT).to_string();
    if space_as_plus {
        encoded.replace("%20", "+")
    } else {
        encoded
    }
}

/// Serialize `params` as a query string. An empty map yields an empty
/// string.
pub fn serialize_query(params: &Params, options: &QueryOptions) -> String {
    let mut pairs: Vec<String> = Vec::new();
    for (key, value) in params.iter() {
        append_pairs(&mut pairs, key, value, options);
    }
    pairs.join(&options.delimiter.to_string())
}

fn append_pairs(pairs: &mut Vec<String>, key: &str, value: &ParamValue, options: &QueryOptions) {
    let write_key = |raw: &str| {
        if options.encode_values_only {
            raw.to_string()
        } else {
            escape(raw, options.space_as_plus)
        }
    };
    let write_value = |value: &ParamValue| {
        value
            .to_plain_string()
            .map(|plain| escape(&plain, options.space_as_plus))
    };

    match value {
        ParamValue::Absent => {
            if !options.skip_nulls {
                pairs.push(format!("{}=", write_key(key)));
            }
        }
        ParamValue::List(items) => {
            let scalars: Vec<String> = items.iter().filter_map(write_value).collect();
            match options.array_format {
                ArrayFormat::Comma => {
                    pairs.push(format!("{}={}", write_key(key), scalars.join(",")));
                }
                ArrayFormat::Repeat => {
                    for v in scalars {
                        pairs.push(format!("{}={v}", write_key(key)));
                    }
                }
                ArrayFormat::Brackets => {
                    for v in scalars {
                        pairs.push(format!("{}={v}", write_key(&format!("{key}[]"))));
                    }
                }
                ArrayFormat::Indices => {
                    for (idx, v) in scalars.iter().enumerate() {
                        pairs.push(format!("{}={v}", write_key(&format!("{key}[{idx}]"))));
                    }
                }
            }
        }
        scalar => {
            if let Some(v) = write_value(scalar) {
                pairs.push(format!("{}={v}", write_key(key)));
            }
        }
    }
}

/// Render the path only; leftover parameters are discarded.
pub fn path(template: &str, params: &Params) -> Result<String, TemplateError> {
    Ok(render_path(template, params)?.path)
}

/// Serialize a query string with default options.
pub fn query(params: &Params) -> String {
    serialize_query(params, &QueryOptions::default())
}

/// Render path and query and join them with `?`, omitting the separator
/// when either side is empty.
pub fn build(template: &str, params: &Params, options: &QueryOptions) -> Result<String, TemplateError> {
    let rendered = render_path(template, params)?;
    let query = serialize_query(&rendered.remaining, options);
    Ok(join(rendered.path, query))
}

fn join(path: String, query: String) -> String {
    if query.is_empty() {
        path
    } else if path.is_empty() {
        query
    } else {
        format!("{path}?{query}")
    }
}
