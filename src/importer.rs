use crate::models::{SpecLabel, Specs};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

/// Lines copied along with listing text that never carry data.
const BOILERPLATE_LINES: &[&str] = &["Kredi Teklifleri"];

// ASCII word boundaries: a Turkish letter after the marker still ends it.
static PRICE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?-u:\b)TL(?-u:\b)").expect("static regex"));

static LABEL_PATTERNS: Lazy<Vec<(SpecLabel, Regex)>> = Lazy::new(|| {
    SpecLabel::ALL
        .iter()
        .map(|label| {
            let pattern = format!(r"(?i)^{}\s+(.*)$", regex::escape(label.text()));
            (*label, Regex::new(&pattern).expect("escaped label regex"))
        })
        .collect()
});

/// Best-effort result of parsing pasted listing text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportedListing {
    pub specs: Specs,
    pub address_line: String,
    pub price_line: String,
}

impl ImportedListing {
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty() && self.address_line.is_empty() && self.price_line.is_empty()
    }
}

/// Collapses whitespace runs (including non-breaking spaces) and trims.
pub fn normalize_spaces(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parses free text copied from a listing page. Unrecognised input yields an
/// empty result rather than an error.
pub fn import_text(raw: &str) -> ImportedListing {
    let text = raw.replace('\r', "\n");
    let lines: Vec<&str> = text
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            !BOILERPLATE_LINES
                .iter()
                .any(|boilerplate| line.eq_ignore_ascii_case(boilerplate))
        })
        .collect();

    let mut imported = ImportedListing::default();
    if lines.is_empty() {
        return imported;
    }

    if let Some(line) = lines.iter().find(|line| PRICE_MARKER.is_match(line)) {
        imported.price_line = normalize_spaces(line);
    }
    if let Some(line) = lines.iter().find(|line| line.contains(" / ")) {
        imported.address_line = normalize_spaces(line);
    }

    for (label, pattern) in LABEL_PATTERNS.iter() {
        let value = lines
            .iter()
            .find_map(|line| pattern.captures(line))
            .and_then(|caps| caps.get(1))
            .map(|m| normalize_spaces(m.as_str()));
        if let Some(value) = value {
            imported.specs.set(*label, value);
        }
    }
    imported.specs.price_line = imported.price_line.clone();

    debug!(
        target = "emlak.importer",
        lines = lines.len(),
        labels = imported.specs.iter().count(),
        has_price = !imported.price_line.is_empty(),
        has_address = !imported.address_line.is_empty(),
        "listing text imported"
    );
    imported
}

/// Short size summary shown on cards, e.g. `3+1 • 120 m²`.
///
/// Area prefers the net figure over the gross one. Empty when neither rooms
/// nor area are known.
pub fn size_label(specs: &Specs) -> String {
    let rooms = specs.get(SpecLabel::Rooms).trim();
    let net = digits(specs.get(SpecLabel::NetArea));
    let area = if net.is_empty() {
        digits(specs.get(SpecLabel::GrossArea))
    } else {
        net
    };
    let area = area.parse::<u64>().ok();
    match (rooms.is_empty(), area) {
        (false, Some(sqm)) => format!("{rooms} • {sqm} m²"),
        (false, None) => rooms.to_string(),
        (true, Some(sqm)) => format!("{sqm} m²"),
        (true, None) => String::new(),
    }
}

fn digits(input: &str) -> String {
    input.chars().filter(char::is_ascii_digit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "Bahçeli 3+1 Daire\r\n\
        2.150.000\u{00A0}TL\n\
        Kredi Teklifleri\n\
        İstanbul / Kadıköy / Moda Mh.\n\
        \n\
        İlan Tarihi   12 Mart 2024\n\
        m² (Brüt) 140\n\
        m² (Net)     120\n\
        Oda Sayısı    3+1\n\
        Isıtma  Kombi   (Doğalgaz)\n\
        Aidat (TL) 1.500\n\
        Krediye Uygun Evet\n";

    #[test]
    fn extracts_price_address_and_labels() {
        let imported = import_text(SAMPLE);
        assert_eq!(imported.price_line, "2.150.000 TL");
        assert_eq!(imported.address_line, "İstanbul / Kadıköy / Moda Mh.");
        assert_eq!(imported.specs.get(SpecLabel::Rooms), "3+1");
        assert_eq!(imported.specs.get(SpecLabel::NetArea), "120");
        assert_eq!(imported.specs.get(SpecLabel::GrossArea), "140");
        assert_eq!(imported.specs.get(SpecLabel::Heating), "Kombi (Doğalgaz)");
        assert_eq!(imported.specs.get(SpecLabel::Dues), "1.500");
        assert_eq!(imported.specs.get(SpecLabel::LoanEligible), "Evet");
        assert_eq!(imported.specs.get(SpecLabel::Exchange), "");
        assert_eq!(imported.specs.price_line, "2.150.000 TL");
    }

    #[test]
    fn room_count_line_is_taken_verbatim() {
        for text in ["Oda Sayısı 3+1", "  Oda Sayısı \t 3+1  ", "x\nOda Sayısı 3+1\ny"] {
            let imported = import_text(text);
            assert_eq!(imported.specs.get(SpecLabel::Rooms), "3+1", "input {text:?}");
        }
    }

    #[test]
    fn label_metacharacters_are_escaped() {
        // "m² (Net)" contains parentheses; unescaped they would form a group.
        let imported = import_text("m² Net 99\nm² (Net) 75");
        assert_eq!(imported.specs.get(SpecLabel::NetArea), "75");
    }

    #[test]
    fn empty_or_unrelated_text_yields_empty_result() {
        assert!(import_text("").is_empty());
        assert!(import_text("\n\r\n   \n").is_empty());
        assert!(import_text("Kredi Teklifleri").is_empty());
        assert!(import_text("merhaba dünya").is_empty());
    }

    #[test]
    fn price_marker_needs_a_standalone_word() {
        let imported = import_text("TLC bakımlı\nFiyat 900 tl");
        assert_eq!(imported.price_line, "Fiyat 900 tl");
    }

    #[test]
    fn price_marker_boundary_is_ascii_only() {
        let imported = import_text("Bahçeli ev\n5.000 TLİ\n100 TL");
        assert_eq!(imported.price_line, "5.000 TLİ");
        let imported = import_text("ÇTLx\n250 TL");
        assert_eq!(imported.price_line, "250 TL");
    }

    #[test]
    fn size_label_combinations() {
        let mut specs = Specs::default();
        assert_eq!(size_label(&specs), "");
        specs.set(SpecLabel::GrossArea, "140 m²");
        assert_eq!(size_label(&specs), "140 m²");
        specs.set(SpecLabel::NetArea, "120");
        assert_eq!(size_label(&specs), "120 m²");
        specs.set(SpecLabel::Rooms, "3+1");
        assert_eq!(size_label(&specs), "3+1 • 120 m²");
    }
}
