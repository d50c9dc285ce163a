//! HTML resource-URL rewriting.
//!
//! HTML responses are rewritten before they are cached or served: every
//! absolute `http://` resource reference (`img`/`script` `src`, `link`
//! `href`) is replaced with its proxied form `http://<proxy>/<hash>` and the
//! original URL is emitted on a channel so the caller can prefetch it while
//! rewriting proceeds. Other attributes and relative references are left
//! untouched.

use anyhow::{Context, Result};
use lol_html::html_content::Element;
use lol_html::{HandlerResult, HtmlRewriter, Settings, element};
use tokio::sync::mpsc;

use crate::key;

/// Rewrites absolute resource URLs in `body`, emitting each original URL on
/// `resources`. Returns the rewritten document.
///
/// The channel is dropped when rewriting finishes, which is how the prefetch
/// drain on the other side learns there is nothing more to fetch.
pub fn rewrite_html(
    body: &[u8],
    proxy_addr: &str,
    resources: mpsc::UnboundedSender<String>,
) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(body.len());
    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: vec![
                element!("img[src]", |el| rewrite_attr(el, "src", proxy_addr, &resources)),
                element!("script[src]", |el| rewrite_attr(el, "src", proxy_addr, &resources)),
                element!("link[href]", |el| rewrite_attr(el, "href", proxy_addr, &resources)),
            ],
            ..Settings::new()
        },
        |chunk: &[u8]| output.extend_from_slice(chunk),
    );
    rewriter.write(body).context("problem parsing html")?;
    rewriter.end().context("problem parsing html")?;
    Ok(output)
}

fn rewrite_attr(
    el: &mut Element,
    attr: &str,
    proxy_addr: &str,
    resources: &mpsc::UnboundedSender<String>,
) -> HandlerResult {
    let Some(value) = el.get_attribute(attr) else {
        return Ok(());
    };
    if !value.starts_with(key::HTTP_PREFIX) {
        return Ok(());
    }
    let _ = resources.send(value.clone());
    el.set_attribute(attr, &format!("http://{proxy_addr}/{}", key::hash(&value)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewrite(body: &str) -> (String, Vec<String>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = rewrite_html(body.as_bytes(), "127.0.0.1:9000", tx).unwrap();
        let mut resources = Vec::new();
        while let Ok(url) = rx.try_recv() {
            resources.push(url);
        }
        (String::from_utf8(output).unwrap(), resources)
    }

    #[test]
    fn rewrites_img_and_link() {
        let (html, resources) = rewrite(concat!(
            "<html><body>",
            r#"<img src="http://a.test/i.png">"#,
            r#"<link href="http://b.test/s.css">"#,
            "</body></html>",
        ));
        assert!(html.contains(&format!(
            r#"src="http://127.0.0.1:9000/{}""#,
            key::hash("a.test/i.png")
        )));
        assert!(html.contains(&format!(
            r#"href="http://127.0.0.1:9000/{}""#,
            key::hash("b.test/s.css")
        )));
        assert_eq!(resources, ["http://a.test/i.png", "http://b.test/s.css"]);
    }

    #[test]
    fn rewrites_script_src() {
        let (html, resources) = rewrite(r#"<script src="http://a.test/app.js"></script>"#);
        assert!(html.contains(&key::hash("a.test/app.js")));
        assert_eq!(resources, ["http://a.test/app.js"]);
    }

    #[test]
    fn leaves_relative_urls_alone() {
        let input = r#"<img src="/local/i.png"><link href="style.css">"#;
        let (html, resources) = rewrite(input);
        assert_eq!(html, input);
        assert!(resources.is_empty());
    }

    #[test]
    fn leaves_https_urls_alone() {
        let input = r#"<img src="https://a.test/i.png">"#;
        let (html, resources) = rewrite(input);
        assert_eq!(html, input);
        assert!(resources.is_empty());
    }

    #[test]
    fn surrounding_markup_is_preserved() {
        let (html, _) = rewrite(r#"<p>before</p><img src="http://a.test/i.png"><p>after</p>"#);
        assert!(html.contains("<p>before</p>"));
        assert!(html.contains("<p>after</p>"));
    }
}
