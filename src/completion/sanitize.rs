use regex::Regex;
use std::sync::LazyLock;

static BOX_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<\|?(?:begin|end)_of_box\|?>").expect("valid box marker regex"));

/// Removes `<begin_of_box>`/`<end_of_box>` artifacts some models leak into their output.
pub fn strip_box_markers(text: &str) -> String {
    BOX_MARKER.replace_all(text, "").into_owned()
}
