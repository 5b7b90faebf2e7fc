//! topic 模板匹配
//!
//! 模板按 `/` 分段，每段要么是字面量，要么是 `{name}` / `{name:regex}` 捕获段。
//! 捕获段的正则必须完整匹配对应的 topic 段；name 为空时只匹配不绑定。
//! 段数不同直接判为不匹配，不存在跨层通配。

use domain::{TOPIC_SEPARATOR, TagSet};
use regex::Regex;

/// 捕获段未指定正则时的默认规则：不含分隔符的任意非空字符串。
pub const DEFAULT_CAPTURE_PATTERN: &str = "[^/]+";

/// 模板配置错误（启动期致命）。
#[derive(Debug, thiserror::Error)]
pub enum MatchConfigError {
    #[error("empty topic template")]
    Empty,
    #[error("invalid pattern in segment `{segment}` of template `{template}`: {source}")]
    InvalidPattern {
        template: String,
        segment: String,
        #[source]
        source: regex::Error,
    },
}

/// 模板段。
#[derive(Debug, Clone)]
pub enum Segment {
    Literal(String),
    Capture { name: String, pattern: Regex },
}

impl Segment {
    /// 匹配单个 topic 段；返回 `None` 表示不匹配，`Some(None)` 表示匹配但不绑定。
    fn match_part<'a>(&'a self, part: &'a str) -> Option<Option<(&'a str, &'a str)>> {
        match self {
            Segment::Literal(text) => (text == part).then_some(None),
            Segment::Capture { name, pattern } => {
                if !pattern.is_match(part) {
                    return None;
                }
                if name.is_empty() {
                    Some(None)
                } else {
                    Some(Some((name.as_str(), part)))
                }
            }
        }
    }
}

/// 编译后的 topic 模板。
#[derive(Debug, Clone)]
pub struct TopicTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl TopicTemplate {
    /// 编译模板字符串，例如 `base/{location}/{sensor}`。
    pub fn compile(template: &str) -> Result<Self, MatchConfigError> {
        if template.is_empty() {
            return Err(MatchConfigError::Empty);
        }
        let segments = template
            .split(TOPIC_SEPARATOR)
            .map(|part| compile_segment(template, part))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// 匹配具体 topic，成功时返回捕获到的 tag。
    pub fn match_topic(&self, topic: &str) -> Option<TagSet> {
        let parts: Vec<&str> = topic.split(TOPIC_SEPARATOR).collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut tags = TagSet::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            if let Some((name, value)) = segment.match_part(part)? {
                tags.insert(name.to_string(), value.to_string());
            }
        }
        Some(tags)
    }
}

fn compile_segment(template: &str, part: &str) -> Result<Segment, MatchConfigError> {
    let Some(inner) = part
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
    else {
        return Ok(Segment::Literal(part.to_string()));
    };

    let (name, expression) = match inner.split_once(':') {
        Some((name, expression)) => (name, expression),
        None => (inner, DEFAULT_CAPTURE_PATTERN),
    };
    let pattern = Regex::new(&format!("^(?:{})$", expression)).map_err(|source| {
        MatchConfigError::InvalidPattern {
            template: template.to_string(),
            segment: part.to_string(),
            source,
        }
    })?;
    Ok(Segment::Capture {
        name: name.to_string(),
        pattern,
    })
}

/// 按配置顺序排列的模板集合，首个匹配的模板生效。
#[derive(Debug, Clone, Default)]
pub struct TopicMatcherSet {
    templates: Vec<TopicTemplate>,
}

impl TopicMatcherSet {
    pub fn compile<S: AsRef<str>>(templates: &[S]) -> Result<Self, MatchConfigError> {
        let templates = templates
            .iter()
            .map(|template| TopicTemplate::compile(template.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { templates })
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// 返回首个匹配模板的捕获结果，后续模板不再尝试。
    pub fn first_match(&self, topic: &str) -> Option<TagSet> {
        self.templates
            .iter()
            .find_map(|template| template.match_topic(topic))
    }
}
