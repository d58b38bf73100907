//! Demo data for running against the mock gateway

use boxsub_core::{AddressKind, CatalogBox, MemoryStore, ShippingAddress, User};
use chrono::{Datelike, Months, Utc};

/// Insert one user with a home and a gift address, plus next month's box
pub fn seed_demo_data(store: &MemoryStore) -> boxsub_core::Result<User> {
    let user = User::new("demo", "demo@example.com");
    store.insert_user(user.clone())?;

    store.insert_address(
        ShippingAddress::new(user.id, AddressKind::Personal)
            .with_recipient("Demo", "User")
            .with_street("1 High Street", "Bristol", "BS1 1AA", "GB")
            .as_default(),
    )?;
    store.insert_address(
        ShippingAddress::new(user.id, AddressKind::Gift)
            .with_recipient("Gift", "Recipient")
            .with_street("2 Station Road", "Leeds", "LS1 1AA", "GB"),
    )?;

    let today = Utc::now().date_naive();
    let shipping_date = today
        .with_day(1)
        .and_then(|first| first.checked_add_months(Months::new(1)))
        .unwrap_or(today);
    store.insert_box(CatalogBox::new("Next Month's Box", shipping_date))?;

    tracing::info!(user_id = %user.id, email = %user.email, %shipping_date, "Seeded demo data");
    Ok(user)
}
