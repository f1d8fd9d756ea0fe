use atom_syndication::{Content, Entry, Feed, Link, Person, Text};
use chrono::{DateTime, Utc};
use url::Url;

use crate::domain::{FeedItem, TaskError, TaskResult};

/// Renders an extraction result as an Atom document. Entry ids are
/// deterministic tag URIs, so re-rendering the same result yields
/// byte-identical XML.
pub fn render_feed(task_url: &str, result: &TaskResult) -> Result<String, TaskError> {
    if result.items.is_empty() {
        return Err(TaskError::EmptyFeed);
    }

    let mut feed = Feed::default();
    feed.set_title(Text::plain(result.title.clone()));
    feed.set_id(task_url.to_string());

    let feed_updated = result.items[0].created.unwrap_or_else(Utc::now);
    feed.set_updated(feed_updated.fixed_offset());

    let mut feed_link = Link::default();
    feed_link.set_href(task_url.to_string());
    feed.set_links(vec![feed_link]);

    if !result.icon.is_empty() {
        feed.set_icon(Some(result.icon.clone()));
    }

    let entries: Vec<Entry> = result.items.iter().filter_map(render_entry).collect();
    if entries.is_empty() {
        return Err(TaskError::EmptyFeed);
    }
    feed.set_entries(entries);

    Ok(feed.to_string())
}

fn render_entry(item: &FeedItem) -> Option<Entry> {
    let link_url = match Url::parse(&item.link) {
        Ok(url) => url,
        Err(err) => {
            tracing::error!(target: "feed", link = %item.link, error = %err, "invalid item link");
            return None;
        }
    };

    let mut entry = Entry::default();
    entry.set_title(Text::plain(item.title.clone()));
    entry.set_id(entry_id(&link_url, item.created, item.updated));

    let updated = item.updated.or(item.created).unwrap_or_else(Utc::now);
    entry.set_updated(updated.fixed_offset());
    if let Some(created) = item.created {
        entry.set_published(Some(created.fixed_offset()));
    }

    let mut link = Link::default();
    link.set_href(item.link.clone());
    let mut links = vec![link];

    if !item.author_name.is_empty() || !item.author_link.is_empty() {
        let mut author = Person::default();
        author.set_name(item.author_name.clone());
        if !item.author_link.is_empty() {
            author.set_uri(Some(item.author_link.clone()));
        }
        entry.set_authors(vec![author]);
    }

    let mut content = item.content.clone();
    let mut description = item.description.clone();
    if !item.enclosure.is_empty() {
        // Readers that ignore enclosure links still get the image inline.
        let image_html = format!(r#"<img src="{}" alt="" />"#, escape_attr(&item.enclosure));
        if !content.is_empty() {
            content = format!("{image_html}{content}");
        } else if !description.is_empty() {
            description = format!("{image_html}{description}");
        }
        let mut enclosure = Link::default();
        enclosure.set_href(item.enclosure.clone());
        enclosure.set_rel("enclosure".to_string());
        links.push(enclosure);
    }
    entry.set_links(links);

    if !description.is_empty() {
        entry.set_summary(Some(Text::html(description)));
    }
    if !content.is_empty() {
        let mut body = Content::default();
        body.set_value(Some(content));
        body.set_content_type(Some("html".to_string()));
        entry.set_content(Some(body));
    }

    Some(entry)
}

/// `tag:<host>,<YYYY-MM-DD>:<path>[?<query>]`, dated by `created` and
/// falling back to `updated`.
fn entry_id(link: &Url, created: Option<DateTime<Utc>>, updated: Option<DateTime<Utc>>) -> String {
    let date = created
        .or(updated)
        .map(|stamp| stamp.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let mut id = format!(
        "tag:{},{}:{}",
        link.host_str().unwrap_or_default(),
        date,
        link.path()
    );
    if let Some(query) = link.query() {
        if !query.is_empty() {
            id.push('?');
            id.push_str(query);
        }
    }
    id
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
