//! Interactive card and application menu models.
//!
//! Cards are typed rather than free-form maps: every card this service sends
//! is a `button_interaction` card, which is also the only shape that can be
//! flattened into a numbered text menu.

use crate::message::{
    EVENT_KEY_CANCEL, EVENT_KEY_CONFIRM, EVENT_KEY_CORE_HELP, EVENT_KEY_CORE_MENU,
    EVENT_KEY_CORE_SELFTEST, EVENT_KEY_SERVICE_SELECT_PREFIX,
};
use serde::{Deserialize, Serialize};

pub const CARD_TYPE_BUTTON_INTERACTION: &str = "button_interaction";
pub const DEFAULT_SOURCE_DESC: &str = "homeops";

pub const BUTTON_STYLE_PRIMARY: u8 = 1;
pub const BUTTON_STYLE_SECONDARY: u8 = 2;

/// Platform limits for the application menu.
pub const MENU_MAX_TOP_BUTTONS: usize = 3;
pub const MENU_MAX_SUB_BUTTONS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardSource {
    pub desc: String,
    pub desc_color: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MainTitle {
    pub title: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub desc: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardButton {
    pub text: String,
    pub style: u8,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplateCard {
    pub card_type: String,
    pub source: CardSource,
    pub main_title: MainTitle,
    pub button_list: Vec<CardButton>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl TemplateCard {
    pub fn button_interaction(title: impl Into<String>, desc: impl Into<String>) -> Self {
        Self {
            card_type: CARD_TYPE_BUTTON_INTERACTION.to_string(),
            source: CardSource {
                desc: DEFAULT_SOURCE_DESC.to_string(),
                desc_color: 1,
            },
            main_title: MainTitle {
                title: title.into(),
                desc: desc.into(),
            },
            button_list: Vec::new(),
            task_id: None,
        }
    }

    pub fn with_button(mut self, text: impl Into<String>, style: u8, key: impl Into<String>) -> Self {
        self.button_list.push(CardButton {
            text: text.into(),
            style,
            key: key.into(),
        });
        self
    }
}

/// A numbered text-menu entry: what the user sees and the event it replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MenuChoice {
    pub label: String,
    pub event_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOption {
    pub key: String,
    pub name: String,
}

/// Service picker listing each provider once, ordered by key.
pub fn service_select_card(services: &[ServiceOption]) -> TemplateCard {
    let mut sorted: Vec<&ServiceOption> = services
        .iter()
        .filter(|s| !s.key.is_empty() && !s.name.is_empty())
        .collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));

    sorted.into_iter().fold(
        TemplateCard::button_interaction("Service menu", "Choose a service"),
        |card, svc| {
            card.with_button(
                svc.name.clone(),
                BUTTON_STYLE_PRIMARY,
                format!("{}{}", EVENT_KEY_SERVICE_SELECT_PREFIX, svc.key),
            )
        },
    )
}

pub fn confirm_card(action: &str, target: &str) -> TemplateCard {
    TemplateCard::button_interaction("Confirm action", format!("{}: {}", action, target))
        .with_button("Confirm", BUTTON_STYLE_SECONDARY, EVENT_KEY_CONFIRM)
        .with_button("Cancel", BUTTON_STYLE_PRIMARY, EVENT_KEY_CANCEL)
}

/// Flattens a card into a numbered list. Returns `None` when the card has no
/// selectable buttons.
pub fn render_text_menu(card: &TemplateCard) -> Option<(String, Vec<MenuChoice>)> {
    let choices: Vec<MenuChoice> = card
        .button_list
        .iter()
        .filter(|b| !b.key.trim().is_empty())
        .map(|b| MenuChoice {
            label: if b.text.trim().is_empty() {
                b.key.trim().to_string()
            } else {
                b.text.trim().to_string()
            },
            event_key: b.key.trim().to_string(),
        })
        .collect();
    if choices.is_empty() {
        return None;
    }

    let mut lines = Vec::with_capacity(choices.len() + 3);
    let title = card.main_title.title.trim();
    if !title.is_empty() {
        lines.push(title.to_string());
    }
    let desc = card.main_title.desc.trim();
    if !desc.is_empty() {
        lines.push(desc.to_string());
    }
    for (i, choice) in choices.iter().enumerate() {
        lines.push(format!("{}. {}", i + 1, choice.label));
    }
    lines.push("Reply with a number to choose.".to_string());

    Some((lines.join("\n"), choices))
}

/// Application menu (`menu/create` body).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Menu {
    #[serde(rename = "button")]
    pub buttons: Vec<MenuButton>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MenuButton {
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(rename = "sub_button", skip_serializing_if = "Vec::is_empty")]
    pub sub_buttons: Vec<MenuButton>,
}

impl MenuButton {
    pub fn click(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: "click".to_string(),
            name: name.into(),
            key: key.into(),
            sub_buttons: Vec::new(),
        }
    }

    pub fn group(name: impl Into<String>, sub_buttons: Vec<MenuButton>) -> Self {
        Self {
            kind: String::new(),
            name: name.into(),
            key: String::new(),
            sub_buttons,
        }
    }
}

/// "Common" built-ins plus a "Services" group with one entry per provider
/// (ordered by key, capped at the platform's sub-button limit).
pub fn default_menu(services: &[ServiceOption]) -> Menu {
    let mut buttons = vec![MenuButton::group(
        "Common",
        vec![
            MenuButton::click("Menu", EVENT_KEY_CORE_MENU),
            MenuButton::click("Self-test", EVENT_KEY_CORE_SELFTEST),
            MenuButton::click("Help", EVENT_KEY_CORE_HELP),
        ],
    )];

    let mut sorted: Vec<&ServiceOption> = services.iter().filter(|s| !s.key.is_empty()).collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));
    let entries: Vec<MenuButton> = sorted
        .into_iter()
        .take(MENU_MAX_SUB_BUTTONS)
        .map(|s| {
            let name = if s.name.is_empty() { &s.key } else { &s.name };
            MenuButton::click(name.clone(), format!("{}{}", EVENT_KEY_SERVICE_SELECT_PREFIX, s.key))
        })
        .collect();
    if !entries.is_empty() {
        buttons.push(MenuButton::group("Services", entries));
    }

    Menu { buttons }
}
