use std::sync::LazyLock;

use regex::Regex;

/// Colon glyphs seen between identifier and name: half-width, full-width,
/// small form and vertical form.
const COLON_CLASS: &str = "[:：﹕︓]";

static ANY_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?:^|[^0-9])([0-9]{{7}})\s*{}\s*(.+)", COLON_CLASS)).unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Heading,
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameMatch {
    pub name: String,
    /// Identifier printed next to the name. Differs from the requested one
    /// when the generic seven-digit pattern matched.
    pub matched_id: String,
    pub source: MatchSource,
}

/// Turns rendered page text into a business name.
pub trait TextExtractionStrategy: Send + Sync {
    fn extract(&self, headings: &[String], body: &str, expected_id: &str) -> Option<NameMatch>;
}

/// Headings first, then any seven-digit id, then the body anchored on the
/// expected id.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadingFirst;

impl TextExtractionStrategy for HeadingFirst {
    fn extract(&self, headings: &[String], body: &str, expected_id: &str) -> Option<NameMatch> {
        let expected_id = expected_id.trim();
        let anchored = (!expected_id.is_empty()).then(|| id_pattern(expected_id));

        if let Some(re) = &anchored {
            for h in headings {
                if let Some(name) = first_name(re, h, 1) {
                    return Some(hit(name, expected_id, MatchSource::Heading));
                }
            }
        }

        for h in headings {
            if let Some(m) = any_id(h, MatchSource::Heading) {
                return Some(m);
            }
        }
        if let Some(m) = any_id(body, MatchSource::Body) {
            return Some(m);
        }

        let re = anchored?;
        first_name(&re, body, 1).map(|name| hit(name, expected_id, MatchSource::Body))
    }
}

fn id_pattern(id: &str) -> Regex {
    let pattern = format!(
        r"(?:^|[^0-9]){}\s*{}\s*(.+)",
        regex::escape(id),
        COLON_CLASS
    );
    // An escaped literal plus fixed syntax always compiles.
    Regex::new(&pattern).unwrap()
}

/// First capture of `group` that is non-empty after trimming.
fn first_name(re: &Regex, text: &str, group: usize) -> Option<String> {
    re.captures_iter(text)
        .filter_map(|c| c.get(group))
        .map(|m| m.as_str().trim())
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn any_id(text: &str, source: MatchSource) -> Option<NameMatch> {
    ANY_ID_RE.captures_iter(text).find_map(|c| {
        let name = c[2].trim();
        (!name.is_empty()).then(|| NameMatch {
            name: name.to_string(),
            matched_id: c[1].to_string(),
            source,
        })
    })
}

fn hit(name: String, id: &str, source: MatchSource) -> NameMatch {
    NameMatch {
        name,
        matched_id: id.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(headings: &[&str], body: &str, id: &str) -> Option<NameMatch> {
        let headings: Vec<String> = headings.iter().map(|s| s.to_string()).collect();
        HeadingFirst.extract(&headings, body, id)
    }

    fn name(headings: &[&str], body: &str, id: &str) -> Option<String> {
        extract(headings, body, id).map(|m| m.name)
    }

    #[test]
    fn heading_with_each_colon_glyph() {
        for colon in [":", "：", "﹕", "︓"] {
            let h = format!("3007608{}株式会社Example ", colon);
            assert_eq!(
                name(&["案件一覧", &h, "3007608：別会社"], "", "3007608").as_deref(),
                Some("株式会社Example"),
                "colon {:?}",
                colon
            );
        }
    }

    #[test]
    fn heading_beats_body() {
        let m = extract(&["  3007608 ： 株式会社Head"], "3007608：株式会社Body", "3007608").unwrap();
        assert_eq!(m.name, "株式会社Head");
        assert_eq!(m.source, MatchSource::Heading);
    }

    #[test]
    fn expected_id_preferred_over_other_heading_ids() {
        let m = extract(&["1111111：他社", "3007608：本命"], "", "3007608").unwrap();
        assert_eq!(m.name, "本命");
    }

    #[test]
    fn falls_back_to_any_seven_digit_id() {
        let m = extract(&["1234567：表示違い株式会社"], "", "3007608").unwrap();
        assert_eq!(m.name, "表示違い株式会社");
        assert_eq!(m.matched_id, "1234567");
    }

    #[test]
    fn body_first_occurrence_wins() {
        let body = "ヘッダー\n2222222：最初の会社\n3333333：次の会社";
        let m = extract(&["ようこそ"], body, "3007608").unwrap();
        assert_eq!(m.name, "最初の会社");
        assert_eq!(m.source, MatchSource::Body);
    }

    #[test]
    fn name_may_sit_on_next_line() {
        assert_eq!(
            name(&[], "3007608：\n株式会社Next\n住所", "3007608").as_deref(),
            Some("株式会社Next")
        );
    }

    #[test]
    fn non_numeric_id_found_in_body() {
        assert_eq!(
            name(&[], "case A-12: Widget Ltd", "A-12").as_deref(),
            Some("Widget Ltd")
        );
    }

    #[test]
    fn metacharacters_in_id_are_literal() {
        assert_eq!(name(&["A.B*：x"], "", "A+B*"), None);
        assert_eq!(name(&["A+B*：Plus Co"], "", "A+B*").as_deref(), Some("Plus Co"));
    }

    #[test]
    fn longer_digit_run_is_not_the_id() {
        assert_eq!(name(&["13007608：偽物"], "", "3007608"), None);
    }

    #[test]
    fn empty_capture_is_not_a_match() {
        assert_eq!(name(&["3007608：   "], "", "3007608"), None);
    }

    #[test]
    fn no_expected_id_uses_generic_pattern() {
        assert_eq!(name(&[], "id 7654321：Generic KK", "").as_deref(), Some("Generic KK"));
    }

    #[test]
    fn nothing_found() {
        assert_eq!(name(&[], "", "3007608"), None);
        assert_eq!(name(&["会社情報"], "住所：東京都", "3007608"), None);
    }
}
