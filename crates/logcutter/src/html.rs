//! HTML rendering of slice events for `LOGS_HTML` listeners.

use crate::{LogSliceEvent, SliceType};

/// Renders one slice event as a self-contained HTML fragment.
pub fn render(evt: &LogSliceEvent) -> String {
    match evt.slice_type {
        SliceType::Phase => format!(
            "<div class=\"phase\" data-name=\"{}\">{}</div>",
            escape(&evt.name),
            escape(&evt.payload)
        ),
        SliceType::Result => format!(
            "<div class=\"result\" data-name=\"{}\">{}</div>",
            escape(&evt.name),
            escape(&evt.payload)
        ),
        SliceType::Content => format!("<div class=\"content\">{}</div>", escape(&evt.payload)),
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_is_escaped() {
        let evt = LogSliceEvent {
            slice_type: SliceType::Content,
            name: String::new(),
            payload: "<script>alert(1)</script>".to_string(),
        };
        let html = render(&evt);
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn phase_carries_its_name() {
        let evt = LogSliceEvent {
            slice_type: SliceType::Phase,
            name: "build".to_string(),
            payload: "compiling".to_string(),
        };
        assert_eq!(
            render(&evt),
            "<div class=\"phase\" data-name=\"build\">compiling</div>"
        );
    }
}
