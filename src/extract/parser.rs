use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::dates::DateParser;
use crate::domain::{ExtractFrom, FeedItem, Task, TaskError, TaskResult};

use super::content::content_from_selector;
use super::urlutil::abs_url;

static TITLE_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static ICON_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("link[rel=apple-touch-icon]").unwrap());

/// Applies a task's selectors to a fetched document and assembles the
/// canonical item list. Items missing a required field are dropped; a page
/// where nothing survives is an extraction failure.
pub struct PageParser<'a> {
    task: &'a Task,
    date_parser: &'a dyn DateParser,
    base_url: Option<Url>,
}

impl<'a> PageParser<'a> {
    pub fn new(task: &'a Task, date_parser: &'a dyn DateParser, base_url: Option<Url>) -> Self {
        Self {
            task,
            date_parser,
            base_url,
        }
    }

    pub fn parse(&self, html: &str) -> Result<TaskResult, TaskError> {
        let document = Html::parse_document(html);
        let root = document.root_element();

        let mut result = TaskResult {
            title: text_of_first(root, &TITLE_SELECTOR),
            ..Default::default()
        };

        if let Some(icon) = root.select(&ICON_SELECTOR).next() {
            result.icon = abs_url(icon.value().attr("href").unwrap_or(""), self.base_url.as_ref());
        }

        let post_selector = compile(&self.task.selector_post)?;
        let posts: Vec<ElementRef<'_>> = root.select(&post_selector).collect();
        if posts.is_empty() {
            return Err(TaskError::Extract("no posts on page".to_string()));
        }
        tracing::debug!(target: "extract", posts = posts.len(), "matched post nodes");

        for post in posts {
            let item = match self.extract_post(post) {
                Ok(item) => item,
                Err(err) => {
                    tracing::warn!(target: "extract", error = %err, "post extraction failed");
                    continue;
                }
            };
            if item.title.is_empty() || item.link.is_empty() || item.created.is_none() {
                tracing::debug!(target: "extract", "post missing required fields, dropped");
                continue;
            }
            result.items.push(item);
        }

        if result.items.is_empty() {
            return Err(TaskError::Extract("extract failed for all posts".to_string()));
        }
        Ok(result)
    }

    fn extract_post(&self, post: ElementRef<'_>) -> Result<FeedItem, TaskError> {
        let base = self.base_url.as_ref();
        let mut item = FeedItem {
            title: text_of_first(post, &compile(&self.task.selector_title)?),
            link: abs_url(
                &attr_of_first(post, &compile(&self.task.selector_link)?, "href"),
                base,
            ),
            ..Default::default()
        };

        if !self.task.selector_description.is_empty() {
            item.description = text_of_first(post, &compile(&self.task.selector_description)?);
        }

        if !self.task.selector_author.is_empty() {
            let author_selector = compile(&self.task.selector_author)?;
            item.author_name = text_of_first(post, &author_selector);
            item.author_link = abs_url(&attr_of_first(post, &author_selector, "href"), base);
        }

        if !self.task.selector_content.is_empty() {
            item.content = content_from_selector(post, &compile(&self.task.selector_content)?, base);
        }

        if !self.task.selector_enclosure.is_empty() {
            item.enclosure = abs_url(
                &attr_of_first(post, &compile(&self.task.selector_enclosure)?, "src"),
                base,
            );
        }

        let created_selector = compile(&self.task.selector_created)?;
        let created_raw = match self.task.created_extract_from {
            ExtractFrom::InnerText => text_of_first(post, &created_selector),
            ExtractFrom::Attribute => {
                attr_of_first(post, &created_selector, &self.task.created_attribute_name)
            }
        };
        match self.date_parser.parse(&created_raw) {
            Ok(created) => item.created = Some(created),
            Err(err) => tracing::warn!(target: "extract", error = %err, "created date unusable"),
        }

        Ok(item)
    }
}

fn compile(selector: &str) -> Result<Selector, TaskError> {
    let trimmed = selector.trim();
    if trimmed.is_empty() {
        return Err(TaskError::Extract("selector is empty".to_string()));
    }
    Selector::parse(trimmed)
        .map_err(|err| TaskError::Extract(format!("invalid selector {trimmed:?}: {err}")))
}

fn text_of_first(scope: ElementRef<'_>, selector: &Selector) -> String {
    match scope.select(selector).next() {
        Some(node) => node_text(node),
        None => String::new(),
    }
}

fn attr_of_first(scope: ElementRef<'_>, selector: &Selector, attr: &str) -> String {
    let attr = attr.trim();
    if attr.is_empty() {
        return String::new();
    }
    scope
        .select(selector)
        .next()
        .and_then(|node| node.value().attr(&attr.to_lowercase()))
        .unwrap_or("")
        .to_string()
}

fn node_text(node: ElementRef<'_>) -> String {
    let words: Vec<&str> = node
        .text()
        .flat_map(str::split_whitespace)
        .collect();
    words.join(" ")
}
