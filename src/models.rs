use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::{collections::BTreeMap, str::FromStr};
use uuid::Uuid;

/// The two kinds of listing the site publishes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ListingType {
    #[serde(rename = "Satılık")]
    ForSale,
    #[serde(rename = "Kiralık")]
    ForRent,
}

impl ListingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingType::ForSale => "Satılık",
            ListingType::ForRent => "Kiralık",
        }
    }
}

impl FromStr for ListingType {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "Satılık" => Ok(ListingType::ForSale),
            "Kiralık" => Ok(ListingType::ForRent),
            other => Err(format!("unknown listing type `{other}`")),
        }
    }
}

/// Unknown or empty types become `None` so validation reports them with the
/// rest of the submission.
fn lenient_listing_type<'de, D>(deserializer: D) -> Result<Option<ListingType>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| value.parse().ok()))
}

/// Labels recognised in pasted listing text and stored in `specs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SpecLabel {
    ListingDate,
    PropertyKind,
    GrossArea,
    NetArea,
    Rooms,
    BuildingAge,
    Floor,
    FloorCount,
    Heating,
    Bathrooms,
    Kitchen,
    Balcony,
    Elevator,
    Parking,
    Furnished,
    UsageStatus,
    InSite,
    SiteName,
    Dues,
    LoanEligible,
    DeedStatus,
    FromWhom,
    Exchange,
}

impl SpecLabel {
    pub const ALL: [SpecLabel; 23] = [
        SpecLabel::ListingDate,
        SpecLabel::PropertyKind,
        SpecLabel::GrossArea,
        SpecLabel::NetArea,
        SpecLabel::Rooms,
        SpecLabel::BuildingAge,
        SpecLabel::Floor,
        SpecLabel::FloorCount,
        SpecLabel::Heating,
        SpecLabel::Bathrooms,
        SpecLabel::Kitchen,
        SpecLabel::Balcony,
        SpecLabel::Elevator,
        SpecLabel::Parking,
        SpecLabel::Furnished,
        SpecLabel::UsageStatus,
        SpecLabel::InSite,
        SpecLabel::SiteName,
        SpecLabel::Dues,
        SpecLabel::LoanEligible,
        SpecLabel::DeedStatus,
        SpecLabel::FromWhom,
        SpecLabel::Exchange,
    ];

    /// The label exactly as it appears in listing text.
    pub fn text(&self) -> &'static str {
        match self {
            SpecLabel::ListingDate => "İlan Tarihi",
            SpecLabel::PropertyKind => "Emlak Tipi",
            SpecLabel::GrossArea => "m² (Brüt)",
            SpecLabel::NetArea => "m² (Net)",
            SpecLabel::Rooms => "Oda Sayısı",
            SpecLabel::BuildingAge => "Bina Yaşı",
            SpecLabel::Floor => "Bulunduğu Kat",
            SpecLabel::FloorCount => "Kat Sayısı",
            SpecLabel::Heating => "Isıtma",
            SpecLabel::Bathrooms => "Banyo Sayısı",
            SpecLabel::Kitchen => "Mutfak",
            SpecLabel::Balcony => "Balkon",
            SpecLabel::Elevator => "Asansör",
            SpecLabel::Parking => "Otopark",
            SpecLabel::Furnished => "Eşyalı",
            SpecLabel::UsageStatus => "Kullanım Durumu",
            SpecLabel::InSite => "Site İçerisinde",
            SpecLabel::SiteName => "Site Adı",
            SpecLabel::Dues => "Aidat (TL)",
            SpecLabel::LoanEligible => "Krediye Uygun",
            SpecLabel::DeedStatus => "Tapu Durumu",
            SpecLabel::FromWhom => "Kimden",
            SpecLabel::Exchange => "Takas",
        }
    }

    pub fn from_text(input: &str) -> Option<Self> {
        SpecLabel::ALL
            .iter()
            .copied()
            .find(|label| label.text() == input)
    }
}

const DESCRIPTION_KEY: &str = "description";
const PRICE_LINE_KEY: &str = "priceLine";

/// Label → text bag stored in the `specs` column.
///
/// Only the enumerated labels plus the description and raw price line are
/// kept; anything else found in stored JSON is dropped on read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Value>",
    into = "BTreeMap<String, String>"
)]
pub struct Specs {
    values: BTreeMap<SpecLabel, String>,
    pub description: String,
    pub price_line: String,
}

impl Specs {
    pub fn get(&self, label: SpecLabel) -> &str {
        self.values.get(&label).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, label: SpecLabel, value: impl Into<String>) {
        let value = value.into();
        if value.trim().is_empty() {
            self.values.remove(&label);
        } else {
            self.values.insert(label, value);
        }
    }

    /// Filled labels in enumeration order.
    pub fn iter(&self) -> impl Iterator<Item = (SpecLabel, &str)> {
        self.values.iter().map(|(label, value)| (*label, value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.description.is_empty() && self.price_line.is_empty()
    }

    fn optional(&self, label: SpecLabel) -> Option<String> {
        let value = self.get(label).trim();
        (!value.is_empty()).then(|| value.to_string())
    }

    fn digits(&self, label: SpecLabel) -> Option<i64> {
        parse_price(self.get(label)).filter(|value| *value > 0)
    }

    fn yes(&self, label: SpecLabel) -> bool {
        matches!(
            self.get(label).trim().to_lowercase().as_str(),
            "evet" | "var"
        )
    }
}

impl From<BTreeMap<String, Value>> for Specs {
    fn from(raw: BTreeMap<String, Value>) -> Self {
        let mut specs = Specs::default();
        for (key, value) in raw {
            let Some(text) = value.as_str() else {
                continue;
            };
            match key.as_str() {
                DESCRIPTION_KEY => specs.description = text.to_string(),
                PRICE_LINE_KEY => specs.price_line = text.to_string(),
                other => {
                    if let Some(label) = SpecLabel::from_text(other) {
                        specs.set(label, text);
                    }
                }
            }
        }
        specs
    }
}

impl From<Specs> for BTreeMap<String, String> {
    fn from(specs: Specs) -> Self {
        let mut out: BTreeMap<String, String> = SpecLabel::ALL
            .iter()
            .map(|label| (label.text().to_string(), specs.get(*label).to_string()))
            .collect();
        out.insert(DESCRIPTION_KEY.into(), specs.description);
        out.insert(PRICE_LINE_KEY.into(), specs.price_line);
        out
    }
}

/// What an editor submits for a listing, before derivation into columns.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ListingFields {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub address: String,
    #[serde(rename = "type", default, deserialize_with = "lenient_listing_type")]
    pub listing_type: Option<ListingType>,
    #[serde(default)]
    pub price_line: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub specs: Specs,
}

/// Column payload written to the `listings` table. Empty attributes are sent
/// as explicit nulls so an update clears them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingColumns {
    pub title: String,
    pub address: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub district: Option<String>,
    #[serde(default)]
    pub neighborhood: Option<String>,
    #[serde(rename = "type")]
    pub listing_type: ListingType,
    pub price_tl: i64,
    #[serde(default)]
    pub sqm_brut: Option<i64>,
    #[serde(default)]
    pub sqm_net: Option<i64>,
    #[serde(default)]
    pub rooms: Option<String>,
    #[serde(default)]
    pub bathrooms: Option<i64>,
    #[serde(default)]
    pub building_age: Option<String>,
    #[serde(default)]
    pub floor: Option<String>,
    #[serde(default)]
    pub floor_count: Option<String>,
    #[serde(default)]
    pub heating: Option<String>,
    #[serde(default)]
    pub kitchen_type: Option<String>,
    #[serde(default)]
    pub balcony: Option<String>,
    #[serde(default)]
    pub elevator: Option<String>,
    #[serde(default)]
    pub parking: Option<String>,
    #[serde(default)]
    pub furnished: Option<String>,
    #[serde(default)]
    pub usage_status: Option<String>,
    #[serde(default)]
    pub in_site: bool,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub dues: Option<String>,
    #[serde(default)]
    pub loan_eligible: bool,
    #[serde(default)]
    pub deed_status: Option<String>,
    #[serde(default)]
    pub from_whom: Option<String>,
    #[serde(default)]
    pub exchange: bool,
    #[serde(default)]
    pub specs: Specs,
}

impl ListingColumns {
    /// Derives every stored column from validated editor fields.
    pub fn from_fields(fields: &ListingFields, listing_type: ListingType) -> Self {
        let location = Location::parse(&fields.address);
        let specs = &fields.specs;
        let mut stored_specs = specs.clone();
        stored_specs.description = fields.description.trim().to_string();
        stored_specs.price_line = fields.price_line.trim().to_string();

        Self {
            title: fields.title.trim().to_string(),
            address: fields.address.trim().to_string(),
            city: location.city,
            district: location.district,
            neighborhood: location.neighborhood,
            listing_type,
            price_tl: parse_price(&fields.price_line).unwrap_or(0),
            sqm_brut: specs.digits(SpecLabel::GrossArea),
            sqm_net: specs.digits(SpecLabel::NetArea),
            rooms: specs.optional(SpecLabel::Rooms),
            bathrooms: specs.digits(SpecLabel::Bathrooms),
            building_age: specs.optional(SpecLabel::BuildingAge),
            floor: specs.optional(SpecLabel::Floor),
            floor_count: specs.optional(SpecLabel::FloorCount),
            heating: specs.optional(SpecLabel::Heating),
            kitchen_type: specs.optional(SpecLabel::Kitchen),
            balcony: specs.optional(SpecLabel::Balcony),
            elevator: specs.optional(SpecLabel::Elevator),
            parking: specs.optional(SpecLabel::Parking),
            furnished: specs.optional(SpecLabel::Furnished),
            usage_status: specs.optional(SpecLabel::UsageStatus),
            in_site: specs.yes(SpecLabel::InSite),
            site_name: specs.optional(SpecLabel::SiteName),
            dues: specs.optional(SpecLabel::Dues),
            loan_eligible: specs.yes(SpecLabel::LoanEligible),
            deed_status: specs.optional(SpecLabel::DeedStatus),
            from_whom: specs.optional(SpecLabel::FromWhom),
            exchange: specs.yes(SpecLabel::Exchange),
            specs: stored_specs,
        }
    }
}

/// A stored listing row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub columns: ListingColumns,
    #[serde(default)]
    pub cover_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ListingRecord {
    /// Raw price line for the editor, falling back to the formatted price.
    pub fn price_line(&self) -> String {
        let stored = self.columns.specs.price_line.trim();
        if !stored.is_empty() {
            return stored.to_string();
        }
        if self.columns.price_tl > 0 {
            format_price(self.columns.price_tl)
        } else {
            String::new()
        }
    }

    pub fn fields(&self) -> ListingFields {
        ListingFields {
            title: self.columns.title.clone(),
            address: self.columns.address.clone(),
            listing_type: Some(self.columns.listing_type),
            price_line: self.price_line(),
            description: self.columns.specs.description.clone(),
            specs: self.columns.specs.clone(),
        }
    }
}

/// A stored `listing_images` row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageRecord {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub url: String,
    pub idx: i32,
}

/// Insert payload for `listing_images`. `id` is only set when restoring rows.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NewImage {
    pub id: Option<Uuid>,
    pub listing_id: Uuid,
    pub url: String,
    pub idx: i32,
}

impl From<&ImageRecord> for NewImage {
    fn from(record: &ImageRecord) -> Self {
        Self {
            id: Some(record.id),
            listing_id: record.listing_id,
            url: record.url.clone(),
            idx: record.idx,
        }
    }
}

/// Public view of one photo of a listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageView {
    pub url: String,
    pub idx: i32,
}

impl From<ImageRecord> for ImageView {
    fn from(record: ImageRecord) -> Self {
        Self {
            url: record.url,
            idx: record.idx,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingPage {
    pub items: Vec<ListingRecord>,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ListOrder {
    #[default]
    #[serde(rename = "newest", alias = "new")]
    Newest,
    #[serde(rename = "priceAsc")]
    PriceAsc,
    #[serde(rename = "priceDesc")]
    PriceDesc,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TypeFilter {
    #[default]
    All,
    #[serde(rename = "Satılık")]
    ForSale,
    #[serde(rename = "Kiralık")]
    ForRent,
}

impl TypeFilter {
    pub fn listing_type(&self) -> Option<ListingType> {
        match self {
            TypeFilter::All => None,
            TypeFilter::ForSale => Some(ListingType::ForSale),
            TypeFilter::ForRent => Some(ListingType::ForRent),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListQuery {
    #[serde(default = "ListQuery::default_page")]
    pub page: u32,
    #[serde(default = "ListQuery::default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub order: ListOrder,
    #[serde(rename = "type", default)]
    pub type_filter: TypeFilter,
}

impl ListQuery {
    pub const DEFAULT_PAGE_SIZE: u32 = 20;

    fn default_page() -> u32 {
        1
    }

    fn default_page_size() -> u32 {
        Self::DEFAULT_PAGE_SIZE
    }

    /// Inclusive row range `(from, to)` for this page.
    pub fn range(&self) -> (u64, u64) {
        let page = self.page.max(1) as u64;
        let size = self.page_size.max(1) as u64;
        let from = (page - 1) * size;
        (from, from + size - 1)
    }
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: Self::DEFAULT_PAGE_SIZE,
            order: ListOrder::Newest,
            type_filter: TypeFilter::All,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Location {
    city: Option<String>,
    district: Option<String>,
    neighborhood: Option<String>,
}

impl Location {
    fn parse(address: &str) -> Self {
        let mut parts = address
            .split('/')
            .map(str::trim)
            .map(|part| (!part.is_empty()).then(|| part.to_string()));
        Self {
            city: parts.next().flatten(),
            district: parts.next().flatten(),
            neighborhood: parts.next().flatten(),
        }
    }
}

/// Digit extraction over a price line: `"2.150.000 TL"` → `2150000`.
pub fn parse_price(line: &str) -> Option<i64> {
    let digits: String = line.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<i64>().ok()
}

/// Renders a price the way Turkish listings show it: `2150000` → `"2.150.000 TL"`.
pub fn format_price(value: i64) -> String {
    if value == 0 {
        return "—".to_string();
    }
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    let sign = if value < 0 { "-" } else { "" };
    format!("{sign}{grouped} TL")
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn price_round_trips_turkish_format() {
        assert_eq!(parse_price("2.150.000 TL"), Some(2_150_000));
        assert_eq!(format_price(2_150_000), "2.150.000 TL");
        assert_eq!(format_price(950), "950 TL");
        assert_eq!(format_price(0), "—");
        assert_eq!(parse_price("fiyat yok"), None);
    }

    #[test]
    fn unknown_or_empty_type_is_left_for_validation() {
        for raw in [json!(""), json!("Villa"), json!(null)] {
            let fields: ListingFields =
                serde_json::from_value(json!({ "title": "x", "type": raw })).unwrap();
            assert_eq!(fields.listing_type, None);
        }
        let fields: ListingFields =
            serde_json::from_value(json!({ "type": " Kiralık " })).unwrap();
        assert_eq!(fields.listing_type, Some(ListingType::ForRent));
        let fields: ListingFields = serde_json::from_value(json!({ "title": "x" })).unwrap();
        assert_eq!(fields.listing_type, None);
    }

    #[test]
    fn specs_serialize_as_flat_label_map() {
        let mut specs = Specs::default();
        specs.set(SpecLabel::Rooms, "3+1");
        specs.price_line = "2.150.000 TL".into();
        let value = serde_json::to_value(&specs).unwrap();
        assert_eq!(value["Oda Sayısı"], json!("3+1"));
        assert_eq!(value["priceLine"], json!("2.150.000 TL"));
        assert_eq!(value["Takas"], json!(""));

        let back: Specs = serde_json::from_value(json!({
            "Oda Sayısı": "3+1",
            "Bilinmeyen": "x",
            "Balkon": 3,
            "description": "Deniz manzaralı",
        }))
        .unwrap();
        assert_eq!(back.get(SpecLabel::Rooms), "3+1");
        assert_eq!(back.get(SpecLabel::Balcony), "");
        assert_eq!(back.description, "Deniz manzaralı");
    }

    #[test]
    fn columns_derive_from_fields() {
        let mut specs = Specs::default();
        specs.set(SpecLabel::NetArea, "120 m²");
        specs.set(SpecLabel::GrossArea, "140");
        specs.set(SpecLabel::Rooms, " 3+1 ");
        specs.set(SpecLabel::InSite, "Evet");
        specs.set(SpecLabel::Exchange, "Hayır");
        specs.set(SpecLabel::Bathrooms, "2");
        let fields = ListingFields {
            title: " Bahçeli daire ".into(),
            address: "İstanbul / Kadıköy / Moda".into(),
            listing_type: Some(ListingType::ForSale),
            price_line: "2.150.000 TL".into(),
            description: "Merkezi konum".into(),
            specs,
        };
        let cols = ListingColumns::from_fields(&fields, ListingType::ForSale);
        assert_eq!(cols.title, "Bahçeli daire");
        assert_eq!(cols.city.as_deref(), Some("İstanbul"));
        assert_eq!(cols.district.as_deref(), Some("Kadıköy"));
        assert_eq!(cols.neighborhood.as_deref(), Some("Moda"));
        assert_eq!(cols.price_tl, 2_150_000);
        assert_eq!(cols.sqm_net, Some(120));
        assert_eq!(cols.sqm_brut, Some(140));
        assert_eq!(cols.rooms.as_deref(), Some("3+1"));
        assert_eq!(cols.bathrooms, Some(2));
        assert!(cols.in_site);
        assert!(!cols.exchange);
        assert_eq!(cols.specs.price_line, "2.150.000 TL");
        assert_eq!(parse_price(&cols.specs.price_line), Some(cols.price_tl));
    }

    #[test]
    fn record_price_line_falls_back_to_formatted_price() {
        let fields = ListingFields {
            title: "t".into(),
            address: "a".into(),
            listing_type: Some(ListingType::ForRent),
            price_line: "25.000 TL".into(),
            ..Default::default()
        };
        let mut columns = ListingColumns::from_fields(&fields, ListingType::ForRent);
        columns.specs.price_line.clear();
        let record = ListingRecord {
            id: Uuid::new_v4(),
            columns,
            cover_url: None,
            created_at: Utc::now(),
        };
        assert_eq!(record.price_line(), "25.000 TL");
    }

    #[test]
    fn list_query_range_is_inclusive() {
        let query = ListQuery {
            page: 3,
            page_size: 6,
            ..Default::default()
        };
        assert_eq!(query.range(), (12, 17));
    }
}
