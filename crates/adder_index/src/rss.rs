//! RSS 2.0 feed of the most recently updated packages.

use serde_json::Value;

use crate::utils::rfc822;

/// How many of the most recent channel entries make the feed.
const FEED_SIZE: usize = 100;

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn element(buffer: &mut String, indent: &str, tag: &str, text: &str) {
    buffer.push_str(&format!("{indent}<{tag}>{}</{tag}>\n", escape(text)));
}

/// Render the feed from a `channeldata.json` document.
pub(crate) fn build_rss(channel_name: &str, channeldata: &Value) -> String {
    let empty = serde_json::Map::new();
    let packages = channeldata
        .get("packages")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    // newest first, name as the deterministic tiebreak
    let mut recent: Vec<(&String, &Value)> = packages
        .iter()
        .filter(|(_, package)| package.get("timestamp").and_then(Value::as_u64).is_some())
        .collect();
    recent.sort_by(|(a_name, a), (b_name, b)| {
        let a_time = a.get("timestamp").and_then(Value::as_u64).unwrap_or(0);
        let b_time = b.get("timestamp").and_then(Value::as_u64).unwrap_or(0);
        b_time.cmp(&a_time).then_with(|| a_name.cmp(b_name))
    });
    recent.truncate(FEED_SIZE);

    let now = rfc822(chrono::Utc::now().timestamp());
    let mut feed = String::new();
    feed.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    feed.push_str("<rss version=\"2.0\">\n");
    feed.push_str("    <channel>\n");
    element(&mut feed, "        ", "title", channel_name);
    element(&mut feed, "        ", "link", channel_name);
    element(
        &mut feed,
        "        ",
        "description",
        &format!(
            "A package channel with {} recently updated packages.",
            recent.len()
        ),
    );
    element(&mut feed, "        ", "pubDate", &now);
    element(&mut feed, "        ", "lastBuildDate", &now);

    for (name, package) in recent {
        let get = |field: &str| package.get(field).and_then(Value::as_str).unwrap_or("");
        let subdirs: Vec<&str> = package
            .get("subdirs")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let description = ["description", "summary"]
            .iter()
            .map(|field| get(field))
            .find(|text| !text.is_empty())
            .unwrap_or("No description.");
        let timestamp = package
            .get("timestamp")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        feed.push_str("        <item>\n");
        // e.g. "7zip 19.00 [osx-64, win-64]"
        element(
            &mut feed,
            "            ",
            "title",
            &format!("{name} {} [{}]", get("version"), subdirs.join(", ")),
        );
        element(&mut feed, "            ", "description", description);
        for (tag, field) in [
            ("link", "doc_url"),
            ("comments", "dev_url"),
            ("guid", "source_url"),
            ("source", "home"),
        ] {
            let text = get(field);
            if !text.is_empty() {
                element(&mut feed, "            ", tag, text);
            }
        }
        element(
            &mut feed,
            "            ",
            "pubDate",
            &rfc822(timestamp as i64),
        );
        feed.push_str("        </item>\n");
    }

    feed.push_str("    </channel>\n");
    feed.push_str("</rss>\n");
    feed
}
