//! Customer profile left in storage by the checkout form.
//!
//! The form saves `{ nome, email, telefone, tipoChave, chavePix }` under a
//! fixed key before requesting the payment. When a source cannot see
//! customer fields itself, this is the next best thing.

use serde::Deserialize;
use tracing::warn;

use crate::host::KeyValueStore;
use crate::signal::Customer;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StoredProfile {
    nome: Option<String>,
    email: Option<String>,
    telefone: Option<String>,
    tipo_chave: Option<String>,
    chave_pix: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Parse a stored profile document.
pub fn parse_profile(raw: &str) -> crate::Result<Customer> {
    let profile: StoredProfile = serde_json::from_str(raw)?;
    let document = match (profile.tipo_chave.as_deref(), profile.chave_pix) {
        (Some("CPF"), Some(key)) => {
            let digits: String = key.chars().filter(char::is_ascii_digit).collect();
            (!digits.is_empty()).then_some(digits)
        }
        _ => None,
    };
    Ok(Customer {
        email: non_empty(profile.email),
        phone: non_empty(profile.telefone),
        name: non_empty(profile.nome),
        document,
    })
}

/// Read the profile stored under `key`; missing or unreadable profiles
/// yield an empty customer.
pub fn read_profile(store: &dyn KeyValueStore, key: &str) -> Customer {
    let Some(raw) = store.get(key) else {
        return Customer::default();
    };
    match parse_profile(&raw) {
        Ok(customer) => customer,
        Err(err) => {
            warn!(key, error = %err, "Stored customer profile is unreadable");
            Customer::default()
        }
    }
}
