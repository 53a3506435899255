//! Plain-text message bodies.
//!
//! Contexts are the JSON objects the dispatcher hands to the sink. Missing
//! values render as empty strings rather than failing the message.

use serde_json::Value as JsonValue;

use cbugg_core::Template;

/// Addressing shared by every message.
#[derive(Debug, Clone)]
pub struct Envelope<'a> {
    pub mail_from: &'a str,
    pub mail_to: &'a str,
    pub base_url: &'a str,
}

fn text<'a>(ctx: &'a JsonValue, pointer: &str) -> &'a str {
    ctx.pointer(pointer).and_then(JsonValue::as_str).unwrap_or("")
}

fn list(ctx: &JsonValue, pointer: &str) -> Vec<String> {
    ctx.pointer(pointer)
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn bug_url(env: &Envelope<'_>, ctx: &JsonValue) -> String {
    format!("{}/bug/{}", env.base_url, text(ctx, "/bug/id"))
}

fn header(env: &Envelope<'_>, subject: &str) -> String {
    format!(
        "From: CBugg <{}>\nTo: {}\nSubject: {}\n\n",
        env.mail_from, env.mail_to, subject
    )
}

/// Render a message body for one recipient.
pub fn render(template: Template, env: &Envelope<'_>, ctx: &JsonValue) -> String {
    let id = text(ctx, "/bug/id");
    let title = text(ctx, "/bug/title");

    match template {
        Template::Comment => format!(
            "{}{} wrote a new comment on \"{}\":\n\n{}\n\n{}\n",
            header(env, &format!("Comment on [{id}] {title}")),
            text(ctx, "/comment/user"),
            title,
            text(ctx, "/comment/text"),
            bug_url(env, ctx),
        ),
        Template::Attachment => {
            let size = ctx
                .pointer("/attachment/size")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0);
            format!(
                "{}There's a new attachment on \"{}\"\n\nIts name is {} and it's {}\n\n\
                 You can grab it here:  {}{}\n\n{}\n",
                header(env, &format!("Attachment on [{id}] {title}")),
                title,
                text(ctx, "/attachment/filename"),
                human_bytes(size),
                env.base_url,
                text(ctx, "/download_url"),
                bug_url(env, ctx),
            )
        }
        Template::BugChanged => {
            let fields: String = list(ctx, "/fields")
                .iter()
                .map(|f| format!("* {f}\n"))
                .collect();
            format!(
                "{}The following bits of the bug were changed by {}:\n\n{}\n\
                 Here's the new state:\n\n\
                 Title:  {}\nStatus: {}\nOwner:  {}\nTags:   {}\n\n{}\n\n\n{}\n",
                header(env, &format!("[{id}] {title}")),
                text(ctx, "/actors_string"),
                fields,
                title,
                text(ctx, "/bug/status"),
                text(ctx, "/bug/owner"),
                list(ctx, "/bug/tags").join(" "),
                text(ctx, "/bug/description"),
                bug_url(env, ctx),
            )
        }
        Template::Assigned => format!(
            "{}The bug \"{}\" was assigned to you.  You were automatically\n\
             subscribed to updates to the bug.\n\nLearn more about it here:\n\n{}\n",
            header(env, &format!("[{id}] Assigned to you: {title}")),
            title,
            bug_url(env, ctx),
        ),
        Template::TagAssigned => format!(
            "{}{} tagged \"{}\" with {}, a tag you follow.\n\n{}\n",
            header(env, &format!("[{id}] Tagged {}: {title}", text(ctx, "/tag"))),
            text(ctx, "/actor"),
            title,
            text(ctx, "/tag"),
            bug_url(env, ctx),
        ),
        Template::Ping => format!(
            "{}{} would like you to look at \"{}\".\n\n{}\n",
            header(env, &format!("[{id}] Your attention please: {title}")),
            text(ctx, "/ping/from"),
            title,
            bug_url(env, ctx),
        ),
    }
}

/// SI byte size, e.g. `82 B`, `1.2 kB`, `83 MB`.
pub fn human_bytes(size: u64) -> String {
    const UNITS: [&str; 7] = ["B", "kB", "MB", "GB", "TB", "PB", "EB"];
    if size < 10 {
        return format!("{size} B");
    }
    let exp = ((size as f64).ln() / 1000f64.ln()).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);
    let value = size as f64 / 1000f64.powi(exp as i32);
    if value < 10.0 {
        format!("{value:.1} {}", UNITS[exp])
    } else {
        format!("{value:.0} {}", UNITS[exp])
    }
}
