//! Inline keyboards for the settings surfaces.

use courier_transport::{Button, InlineKeyboard};

fn chip(text: &str, data: &str) -> Button {
    Button {
        text: text.to_string(),
        callback_data: data.to_string(),
    }
}

pub fn settings_keyboard() -> InlineKeyboard {
    InlineKeyboard {
        rows: vec![
            vec![
                chip("Concise", "cfg:style:user:concise"),
                chip("Detailed", "cfg:style:user:detailed"),
            ],
            vec![
                chip("Cautious", "cfg:risk:user:cautious"),
                chip("Balanced", "cfg:risk:user:balanced"),
                chip("Advanced", "cfg:risk:user:advanced"),
            ],
            vec![
                chip("Mainnet", "cfg:network:user:mainnet"),
                chip("Testnet", "cfg:network:user:testnet"),
            ],
        ],
    }
}

pub fn wallet_keyboard(session_id: &str) -> InlineKeyboard {
    InlineKeyboard::row(vec![
        chip("Check status", &format!("wallet:status:{session_id}")),
        chip("Cancel", &format!("wallet:cancel:{session_id}")),
    ])
}

pub fn network_keyboard() -> InlineKeyboard {
    InlineKeyboard::row(vec![
        chip("Mainnet", "cfg:network:user:mainnet"),
        chip("Testnet", "cfg:network:user:testnet"),
    ])
}
