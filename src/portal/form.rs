//! Form state extraction for WebForms postbacks.
//!
//! A postback must echo the hidden fields (`__VIEWSTATE`,
//! `__EVENTVALIDATION`, ...) of the page it was rendered from. These helpers
//! pull that state out of raw HTML. They never fail: a page without a form
//! yields an empty set and callers decide whether that is acceptable.
//!
//! `scraper::Html` is not `Send`, so everything here takes `&str` and parses
//! internally; nothing parsed is held across an `.await`.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};

use super::entities::normalize_text;

static INPUT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("input").expect("static selector"));
static SELECT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("select").expect("static selector"));
static OPTION: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("option").expect("static selector"));
static WITH_ID: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[id]").expect("static selector"));
static IFRAME: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("iframe[src]").expect("static selector"));

pub const EVENT_TARGET: &str = "__EVENTTARGET";
pub const EVENT_ARGUMENT: &str = "__EVENTARGUMENT";

/// Hidden fields from one page render, in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormFieldSet(Vec<(String, String)>);

impl FormFieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Set a field, replacing an existing value in place.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| n == name) {
            Some(existing) => existing.1 = value,
            None => self.0.push((name.to_string(), value)),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Consume into the pairs a form POST sends.
    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.0
    }

    /// Fields for a postback fired by `event_target`.
    pub fn postback(mut self, event_target: &str, event_argument: &str) -> Self {
        self.set(EVENT_TARGET, event_target);
        self.set(EVENT_ARGUMENT, event_argument);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectOption {
    pub value: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectField {
    pub name: String,
    pub id: Option<String>,
    pub options: Vec<SelectOption>,
    pub selected_value: Option<String>,
}

impl SelectField {
    /// Value of the option whose text matches `label`, ignoring case and
    /// surrounding whitespace.
    pub fn value_for_label(&self, label: &str) -> Option<&str> {
        let wanted = label.trim().to_lowercase();
        self.options
            .iter()
            .find(|o| o.text.to_lowercase() == wanted)
            .map(|o| o.value.as_str())
    }
}

/// All `<input type="hidden">` name/value pairs on the page.
pub fn extract_hidden_fields(html: &str) -> FormFieldSet {
    let document = Html::parse_document(html);
    let mut fields = FormFieldSet::new();
    for input in document.select(&INPUT) {
        let is_hidden = input
            .attr("type")
            .map(|t| t.trim().eq_ignore_ascii_case("hidden"))
            .unwrap_or(false);
        if !is_hidden {
            continue;
        }
        let Some(name) = input.attr("name").filter(|n| !n.is_empty()) else {
            continue;
        };
        fields.set(name, input.attr("value").unwrap_or_default());
    }
    fields
}

/// All named `<select>` elements with their options.
pub fn extract_selects(html: &str) -> Vec<SelectField> {
    let document = Html::parse_document(html);
    document
        .select(&SELECT)
        .filter_map(|select| {
            let name = select.attr("name").filter(|n| !n.is_empty())?.to_string();
            let mut selected_value = None;
            let options = select
                .select(&OPTION)
                .map(|option| {
                    let text = normalize_text(&element_text(&option));
                    let value = option
                        .attr("value")
                        .map(str::to_string)
                        .unwrap_or_else(|| text.clone());
                    if option.attr("selected").is_some() {
                        selected_value = Some(value.clone());
                    }
                    SelectOption { value, text }
                })
                .collect::<Vec<_>>();
            // Browsers submit the first option when nothing is marked selected.
            if selected_value.is_none() {
                selected_value = options.first().map(|o| o.value.clone());
            }
            Some(SelectField {
                name,
                id: select.attr("id").map(str::to_string),
                options,
                selected_value,
            })
        })
        .collect()
}

/// Normalized text of the element with the given id, if present.
pub fn element_text_by_id(html: &str, id: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let found = document
        .select(&WITH_ID)
        .find(|element| element.value().id() == Some(id))
        .map(|element| normalize_text(&element_text(&element)));
    found
}

/// `src` of the first iframe on the page.
pub fn first_iframe_src(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let src = document
        .select(&IFRAME)
        .filter_map(|iframe| iframe.attr("src"))
        .map(str::trim)
        .find(|src| !src.is_empty())
        .map(str::to_string);
    src
}

pub(crate) fn element_text(element: &ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN_PAGE: &str = r#"
<html><body>
<form method="post" action="./default.aspx" id="form1">
  <input type="hidden" name="__EVENTTARGET" id="__EVENTTARGET" value="" />
  <input type="hidden" name="__EVENTARGUMENT" id="__EVENTARGUMENT" value="" />
  <input value="/wEPDwUKMTY1NDU2MTA1Mg9kFgI=" name="__VIEWSTATE" type="hidden" id="__VIEWSTATE" />
  <input type='HIDDEN' id='__VIEWSTATEGENERATOR' name='__VIEWSTATEGENERATOR' value='CA0B0334' />
  <input type=hidden name=__EVENTVALIDATION value=/wEdAAS7 />
  <input type="text" name="txtKullaniciAd" value="" />
  <input type="password" name="txtSifre" />
  <input type="submit" name="btnGiris" value="Giriş" />
</form>
</body></html>"#;

    #[test]
    fn hidden_fields_only_and_all_of_them() {
        let fields = extract_hidden_fields(LOGIN_PAGE);
        assert_eq!(fields.len(), 5);
        assert_eq!(fields.get("__EVENTTARGET"), Some(""));
        assert_eq!(
            fields.get("__VIEWSTATE"),
            Some("/wEPDwUKMTY1NDU2MTA1Mg9kFgI=")
        );
        assert_eq!(fields.get("__VIEWSTATEGENERATOR"), Some("CA0B0334"));
        assert_eq!(fields.get("__EVENTVALIDATION"), Some("/wEdAAS7"));
        assert!(!fields.contains("txtKullaniciAd"));
        assert!(!fields.contains("btnGiris"));
    }

    #[test]
    fn no_form_is_empty_not_error() {
        assert!(extract_hidden_fields("<html><body>bakım çalışması</body></html>").is_empty());
        assert!(extract_selects("").is_empty());
    }

    #[test]
    fn postback_overrides_event_fields() {
        let fields = extract_hidden_fields(LOGIN_PAGE).postback("cmbListeTuru", "");
        assert_eq!(fields.get(EVENT_TARGET), Some("cmbListeTuru"));
        assert_eq!(fields.len(), 5);
    }

    #[test]
    fn selects_with_options_and_entities() {
        let html = r#"
<select name="cmbListeTuru" id="cmbListeTuru">
  <option value="1">Ara&#231;</option>
  <option selected="selected" value="2">Sim&#252;lat&#246;r</option>
</select>
<select name="cmbBos"></select>"#;
        let selects = extract_selects(html);
        assert_eq!(selects.len(), 2);
        let kind = &selects[0];
        assert_eq!(kind.id.as_deref(), Some("cmbListeTuru"));
        assert_eq!(kind.options.len(), 2);
        assert_eq!(kind.options[0].text, "Araç");
        assert_eq!(kind.selected_value.as_deref(), Some("2"));
        assert_eq!(kind.value_for_label(" simülatör "), Some("2"));
        assert_eq!(selects[1].selected_value, None);
    }

    #[test]
    fn element_text_and_iframe() {
        let html = r#"<span id="lblHata"> Kullanıcı Adı veya Şifre Hatalı </span>
<iframe src="https://onay.example/frame.aspx?token=abc123&amp;x=1"></iframe>"#;
        assert_eq!(
            element_text_by_id(html, "lblHata").as_deref(),
            Some("Kullanıcı Adı veya Şifre Hatalı")
        );
        assert_eq!(element_text_by_id(html, "missing"), None);
        assert_eq!(
            first_iframe_src(html).as_deref(),
            Some("https://onay.example/frame.aspx?token=abc123&x=1")
        );
    }
}
