//! Server-rendered pages.

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title}</title>
<style>
body {{ font-family: sans-serif; margin: 2rem auto; max-width: 60rem; }}
nav a {{ margin-right: 1rem; }}
img.stream {{ max-width: 100%; border: 1px solid #ccc; }}
.error {{ color: #b00020; }}
</style>
</head>
<body>
<nav><a href="/home">Home</a><a href="/Detections">Upload</a><a href="/webapp">Webcam</a></nav>
{body}
</body>
</html>
"#
    )
}

/// Minimal HTML escaping for text placed in element bodies and attributes.
fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

pub fn index_page() -> String {
    layout(
        "Object detection",
        r#"<h1>Object detection</h1>
<p>Upload an image or a video to see detections drawn over it, or open the live webcam stream.</p>
<p><a href="/Detections">Upload media</a> | <a href="/webapp">Webcam stream</a></p>"#,
    )
}

/// Upload form. `preview` shows the stream of the uploaded file; `error` is shown above the form.
pub fn upload_page(preview: Option<&str>, error: Option<&str>) -> String {
    let error = error
        .map(|message| format!(r#"<p class="error">{}</p>"#, escape(message)))
        .unwrap_or_default();
    let preview = preview
        .map(|name| {
            format!(
                r#"<h2>{}</h2>
<img class="stream" src="/media" alt="Detections">"#,
                escape(name)
            )
        })
        .unwrap_or_default();

    layout(
        "Run detection",
        &format!(
            r#"<h1>Run detection</h1>
{error}
<form method="post" action="/Detections" enctype="multipart/form-data">
<input type="file" name="file" required>
<button type="submit">Run</button>
</form>
{preview}"#
        ),
    )
}

pub fn not_found_page() -> String {
    layout(
        "Page not found",
        r#"<h1>404</h1>
<p>The page you are looking for does not exist.</p>"#,
    )
}

pub fn server_error_page() -> String {
    layout(
        "Server error",
        r#"<h1>500</h1>
<p>Something went wrong while processing the media.</p>"#,
    )
}
