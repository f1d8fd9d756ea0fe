use scraper::{ElementRef, Selector};
use url::Url;

use super::urlutil::abs_url;

/// Inline markup allowed to survive sanitisation.
const ALLOWED_MARKUP: [&str; 3] = ["b", "i", "strong"];

/// Subtrees whose text must never leak into the output.
const DROPPED_SUBTREES: [&str; 3] = ["script", "style", "noscript"];

/// Extracts the sanitised content HTML for one post: paragraphs of text with
/// whitelisted inline markup, interleaved with absolutised images. All other
/// element tags are transparent.
pub fn content_from_selector(post: ElementRef<'_>, selector: &Selector, base: Option<&Url>) -> String {
    match post.select(selector).next() {
        Some(node) => sanitize_subtree(node, base),
        None => String::new(),
    }
}

pub fn sanitize_subtree(root: ElementRef<'_>, base: Option<&Url>) -> String {
    let mut builder = ContentBuilder::new(base);
    builder.walk_children(root);
    builder.finish()
}

struct ContentBuilder<'a> {
    base: Option<&'a Url>,
    out: String,
    paragraph: String,
}

impl<'a> ContentBuilder<'a> {
    fn new(base: Option<&'a Url>) -> Self {
        Self {
            base,
            out: String::new(),
            paragraph: String::new(),
        }
    }

    fn walk_children(&mut self, element: ElementRef<'_>) {
        for child in element.children() {
            if let Some(el) = child.value().as_element() {
                let tag = el.name();
                if DROPPED_SUBTREES.contains(&tag) {
                    continue;
                }
                if tag == "img" {
                    self.finish_paragraph();
                    self.push_image(el.attr("src").unwrap_or(""));
                    continue;
                }
                let Some(child_ref) = ElementRef::wrap(child) else {
                    continue;
                };
                if ALLOWED_MARKUP.contains(&tag) {
                    self.paragraph.push('<');
                    self.paragraph.push_str(tag);
                    self.paragraph.push('>');
                    self.walk_children(child_ref);
                    // No dangling space inside the closing tag.
                    while self.paragraph.ends_with(' ') {
                        self.paragraph.pop();
                    }
                    self.paragraph.push_str("</");
                    self.paragraph.push_str(tag);
                    self.paragraph.push('>');
                } else {
                    self.walk_children(child_ref);
                }
            } else if let Some(text) = child.value().as_text() {
                self.push_text(text);
            }
        }
    }

    fn push_text(&mut self, raw: &str) {
        if raw.trim().is_empty() {
            return;
        }
        // Collapse internal whitespace; a trailing space keeps words from
        // neighbouring nodes separated.
        if raw.starts_with(char::is_whitespace)
            && !self.paragraph.is_empty()
            && !self.paragraph.ends_with(' ')
        {
            self.paragraph.push(' ');
        }
        for word in raw.split_whitespace() {
            self.paragraph.push_str(word);
            self.paragraph.push(' ');
        }
    }

    fn push_image(&mut self, src: &str) {
        let resolved = abs_url(src, self.base);
        if resolved.is_empty() {
            return;
        }
        self.out.push_str("<img src=\"");
        self.out.push_str(&resolved);
        self.out.push_str("\"/>");
    }

    fn finish_paragraph(&mut self) {
        let text = self.paragraph.trim();
        if !text.is_empty() {
            self.out.push_str("<p>");
            self.out.push_str(text);
            self.out.push_str("</p>");
        }
        self.paragraph.clear();
    }

    fn finish(mut self) -> String {
        self.finish_paragraph();
        self.out
    }
}

#[cfg(test)]
mod tests {
    use scraper::Html;

    use super::*;

    fn sanitize(html: &str, base: &str) -> String {
        let document = Html::parse_fragment(html);
        let selector = Selector::parse("div").unwrap();
        let node = document.select(&selector).next().unwrap();
        let base = Url::parse(base).unwrap();
        sanitize_subtree(node, Some(&base))
    }

    #[test]
    fn strips_scripts_resolves_images_and_keeps_inline_markup() {
        let html = r#"<div><script>x</script>Hello <b>world</b><img src="/a.png"><p>more</p></div>"#;
        assert_eq!(
            sanitize(html, "https://base/"),
            r#"<p>Hello <b>world</b></p><img src="https://base/a.png"/><p>more</p>"#
        );
    }

    #[test]
    fn output_contains_no_tags_outside_the_whitelist() {
        let html = r#"<div><section><h2>Head</h2><em>soft</em> <strong>hard</strong></section><style>p{}</style></div>"#;
        let result = sanitize(html, "https://base/");
        assert_eq!(result, "<p>Head soft <strong>hard</strong></p>");
    }

    #[test]
    fn word_boundaries_survive_around_inline_tags() {
        let html = "<div>both <b>bold</b> and plain</div>";
        assert_eq!(
            sanitize(html, "https://base/"),
            "<p>both <b>bold</b> and plain</p>"
        );
    }

    #[test]
    fn empty_paragraphs_are_dropped() {
        let html = "<div><p>   </p><p></p><span>text</span></div>";
        assert_eq!(sanitize(html, "https://base/"), "<p>text</p>");
    }

    #[test]
    fn images_without_a_source_are_omitted() {
        let html = r#"<div>before<img><img src="">after</div>"#;
        assert_eq!(sanitize(html, "https://base/"), "<p>before</p><p>after</p>");
    }

    #[test]
    fn consecutive_images_each_break_the_paragraph() {
        let html = r#"<div>a<img src="/1.png"><img src="/2.png">b</div>"#;
        assert_eq!(
            sanitize(html, "https://base/"),
            r#"<p>a</p><img src="https://base/1.png"/><img src="https://base/2.png"/><p>b</p>"#
        );
    }
}
