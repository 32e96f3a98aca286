//! In-process [`Store`] for tests.
//!
//! All state sits behind one mutex and every trait method runs as a single
//! critical section, which gives the same exactly-once guarantees as the
//! guarded updates in the Postgres repositories. Fault switches let tests
//! exercise the degraded paths.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use vdiamond_core::{
    CartId, CartItemId, CartStatus, Email, OrderStatus, Price, ProductId, SubjectStatus,
    TokenId, TokenPurpose, TokenStatus, TokenValue, UserId,
};

use super::{CartStore, CredentialStore, ProductCatalog, RepositoryError, Store, SubjectStore};
use crate::models::{
    Cart, CartItem, CartLine, EphemeralToken, NewSubject, NewToken, Product, Subject,
};

#[derive(Default)]
struct Faults {
    unavailable: bool,
    cart_creation: bool,
    reap: HashSet<UserId>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    subjects: BTreeMap<UserId, Subject>,
    tokens: BTreeMap<TokenId, EphemeralToken>,
    carts: BTreeMap<CartId, Cart>,
    items: BTreeMap<CartItemId, CartItem>,
    products: BTreeMap<ProductId, Product>,
    faults: Faults,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn cart_is_open(&self, id: CartId) -> bool {
        self.carts.get(&id).is_some_and(|c| c.status == CartStatus::Open)
    }

    fn insert_subject(&mut self, new: NewSubject) -> Result<Subject, RepositoryError> {
        let taken = self.subjects.values().any(|s| {
            s.email == new.email
                || (new.external_id.is_some() && s.external_id == new.external_id)
        });
        if taken {
            return Err(RepositoryError::Conflict(
                "email or external identity already exists".to_owned(),
            ));
        }

        let now = Utc::now();
        let subject = Subject {
            id: UserId::new(self.next_id()),
            email: new.email,
            name: new.name,
            picture: new.picture,
            password_hash: new.password_hash,
            external_id: new.external_id,
            status: new.status,
            role: vdiamond_core::Role::User,
            created_at: now,
            updated_at: now,
        };
        self.subjects.insert(subject.id, subject.clone());
        Ok(subject)
    }

    fn supersede_and_insert(&mut self, new: NewToken) -> EphemeralToken {
        for token in self.tokens.values_mut() {
            if token.user_id == new.user_id
                && token.purpose == new.purpose
                && token.status == TokenStatus::Unconfirmed
            {
                token.status = TokenStatus::Expired;
            }
        }

        let token = EphemeralToken {
            id: TokenId::new(self.next_id()),
            user_id: new.user_id,
            purpose: new.purpose,
            value: new.value,
            status: TokenStatus::Unconfirmed,
            created_at: new.created_at,
        };
        self.tokens.insert(token.id, token.clone());
        token
    }

    fn flip(&mut self, id: TokenId, from: TokenStatus, to: TokenStatus) -> bool {
        match self.tokens.get_mut(&id) {
            Some(token) if token.status == from => {
                token.status = to;
                true
            }
            _ => false,
        }
    }

    fn delete_subject_cascade(&mut self, id: UserId) {
        self.subjects.remove(&id);
        self.tokens.retain(|_, t| t.user_id != id);
        let carts: HashSet<CartId> = self
            .carts
            .values()
            .filter(|c| c.user_id == id)
            .map(|c| c.id)
            .collect();
        self.carts.retain(|cid, _| !carts.contains(cid));
        self.items.retain(|_, i| !carts.contains(&i.cart_id));
    }
}

/// Shared in-memory store. Clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock for a trait call, honoring the `unavailable` switch.
    fn guard(&self) -> Result<MutexGuard<'_, State>, RepositoryError> {
        let state = self.state();
        if state.faults.unavailable {
            return Err(RepositoryError::Unavailable(
                "memory store switched off".to_owned(),
            ));
        }
        Ok(state)
    }

    /// Add a catalog entry.
    pub fn insert_product(&self, name: &str, price: Price, stock: i32) -> Product {
        let mut state = self.state();
        let product = Product {
            id: ProductId::new(state.next_id()),
            name: name.to_owned(),
            price,
            stock,
        };
        state.products.insert(product.id, product.clone());
        product
    }

    /// Make every trait call fail with `Unavailable`.
    pub fn set_unavailable(&self, on: bool) {
        self.state().faults.unavailable = on;
    }

    /// Make `create_open_cart` fail with `Unavailable`.
    pub fn fail_cart_creation(&self, on: bool) {
        self.state().faults.cart_creation = on;
    }

    /// Make `reap_registration` fail for one subject.
    pub fn fail_reap_for(&self, id: UserId) {
        self.state().faults.reap.insert(id);
    }

    /// Number of open carts a subject holds. Should never exceed one.
    #[must_use]
    pub fn open_cart_count(&self, id: UserId) -> usize {
        self.state()
            .carts
            .values()
            .filter(|c| c.user_id == id && c.status == CartStatus::Open)
            .count()
    }

    /// Number of tokens a subject holds, in any status.
    #[must_use]
    pub fn token_count(&self, id: UserId) -> usize {
        self.state().tokens.values().filter(|t| t.user_id == id).count()
    }
}

impl SubjectStore for MemoryStore {
    async fn create_subject(&self, new: NewSubject) -> Result<Subject, RepositoryError> {
        self.guard()?.insert_subject(new)
    }

    async fn subject_by_id(&self, id: UserId) -> Result<Option<Subject>, RepositoryError> {
        Ok(self.guard()?.subjects.get(&id).cloned())
    }

    async fn subject_by_email(&self, email: &Email) -> Result<Option<Subject>, RepositoryError> {
        Ok(self
            .guard()?
            .subjects
            .values()
            .find(|s| &s.email == email)
            .cloned())
    }

    async fn subject_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Subject>, RepositoryError> {
        Ok(self
            .guard()?
            .subjects
            .values()
            .find(|s| s.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn update_subject(&self, subject: &Subject) -> Result<(), RepositoryError> {
        let mut state = self.guard()?;
        if subject.external_id.is_some()
            && state
                .subjects
                .values()
                .any(|s| s.id != subject.id && s.external_id == subject.external_id)
        {
            return Err(RepositoryError::Conflict(
                "external identity already linked".to_owned(),
            ));
        }

        let stored = state
            .subjects
            .get_mut(&subject.id)
            .ok_or(RepositoryError::NotFound)?;
        stored.name.clone_from(&subject.name);
        stored.picture.clone_from(&subject.picture);
        stored.external_id.clone_from(&subject.external_id);
        stored.status = subject.status;
        stored.role = subject.role;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn update_password(
        &self,
        id: UserId,
        password_hash: &str,
    ) -> Result<(), RepositoryError> {
        let mut state = self.guard()?;
        let stored = state.subjects.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        stored.password_hash = Some(password_hash.to_owned());
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn list_subjects(&self) -> Result<Vec<Subject>, RepositoryError> {
        Ok(self.guard()?.subjects.values().cloned().collect())
    }

    async fn count_subjects(&self) -> Result<i64, RepositoryError> {
        Ok(i64::try_from(self.guard()?.subjects.len()).unwrap_or(i64::MAX))
    }
}

impl CredentialStore for MemoryStore {
    async fn issue_token(&self, new: NewToken) -> Result<EphemeralToken, RepositoryError> {
        let mut state = self.guard()?;
        if !state.subjects.contains_key(&new.user_id) {
            return Err(RepositoryError::NotFound);
        }
        Ok(state.supersede_and_insert(new))
    }

    async fn token_by_value(
        &self,
        value: &TokenValue,
    ) -> Result<Option<EphemeralToken>, RepositoryError> {
        Ok(self
            .guard()?
            .tokens
            .values()
            .find(|t| &t.value == value)
            .cloned())
    }

    async fn latest_token(
        &self,
        user_id: UserId,
        purpose: TokenPurpose,
    ) -> Result<Option<EphemeralToken>, RepositoryError> {
        Ok(self
            .guard()?
            .tokens
            .values()
            .filter(|t| t.user_id == user_id && t.purpose == purpose)
            .max_by_key(|t| (t.created_at, t.id))
            .cloned())
    }

    async fn transition_token(
        &self,
        id: TokenId,
        from: TokenStatus,
        to: TokenStatus,
    ) -> Result<bool, RepositoryError> {
        Ok(self.guard()?.flip(id, from, to))
    }

    async fn unconfirmed_before(
        &self,
        purpose: TokenPurpose,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<EphemeralToken>, RepositoryError> {
        let mut stale: Vec<EphemeralToken> = self
            .guard()?
            .tokens
            .values()
            .filter(|t| {
                t.purpose == purpose
                    && t.status == TokenStatus::Unconfirmed
                    && t.created_at < cutoff
            })
            .cloned()
            .collect();
        stale.sort_by_key(|t| t.created_at);
        Ok(stale)
    }

    async fn register_pending(
        &self,
        subject: NewSubject,
        value: TokenValue,
        now: DateTime<Utc>,
    ) -> Result<(Subject, EphemeralToken), RepositoryError> {
        let mut state = self.guard()?;
        let subject = state.insert_subject(subject)?;
        let token = state.supersede_and_insert(NewToken {
            user_id: subject.id,
            purpose: TokenPurpose::ConfirmRegistration,
            value,
            created_at: now,
        });
        Ok((subject, token))
    }

    async fn confirm_registration(
        &self,
        token: TokenId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.guard()?;
        if !state.flip(token, TokenStatus::Unconfirmed, TokenStatus::Confirmed) {
            return Ok(false);
        }
        if let Some(subject) = state.subjects.get_mut(&user_id)
            && subject.status == SubjectStatus::Pending
        {
            subject.status = SubjectStatus::Active;
            subject.updated_at = Utc::now();
        }
        Ok(true)
    }

    async fn consume_reset(
        &self,
        token: TokenId,
        user_id: UserId,
        password_hash: &str,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.guard()?;
        if !state.subjects.contains_key(&user_id) {
            return Err(RepositoryError::NotFound);
        }
        if !state.flip(token, TokenStatus::Unconfirmed, TokenStatus::Used) {
            return Ok(false);
        }
        if let Some(subject) = state.subjects.get_mut(&user_id) {
            subject.password_hash = Some(password_hash.to_owned());
            subject.updated_at = Utc::now();
        }
        Ok(true)
    }

    async fn reap_registration(
        &self,
        token: TokenId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.guard()?;
        if state.faults.reap.contains(&user_id) {
            return Err(RepositoryError::Unavailable(format!(
                "reap of subject {user_id} switched off"
            )));
        }

        let token_live = state.tokens.get(&token).is_some_and(|t| {
            t.user_id == user_id && t.status == TokenStatus::Unconfirmed
        });
        let subject_pending = state
            .subjects
            .get(&user_id)
            .is_some_and(|s| s.status == SubjectStatus::Pending);
        if !(token_live && subject_pending) {
            return Ok(false);
        }

        state.delete_subject_cascade(user_id);
        Ok(true)
    }
}

impl CartStore for MemoryStore {
    async fn open_cart(&self, user_id: UserId) -> Result<Option<Cart>, RepositoryError> {
        Ok(self
            .guard()?
            .carts
            .values()
            .find(|c| c.user_id == user_id && c.status == CartStatus::Open)
            .cloned())
    }

    async fn create_open_cart(&self, user_id: UserId) -> Result<Cart, RepositoryError> {
        let mut state = self.guard()?;
        if state.faults.cart_creation {
            return Err(RepositoryError::Unavailable(
                "cart creation switched off".to_owned(),
            ));
        }
        if state
            .carts
            .values()
            .any(|c| c.user_id == user_id && c.status == CartStatus::Open)
        {
            return Err(RepositoryError::Conflict("open cart already exists".to_owned()));
        }

        let cart = Cart {
            id: CartId::new(state.next_id()),
            user_id,
            status: CartStatus::Open,
            order_status: None,
            created_at: Utc::now(),
            closed_at: None,
        };
        state.carts.insert(cart.id, cart.clone());
        Ok(cart)
    }

    async fn cart_by_id(&self, id: CartId) -> Result<Option<Cart>, RepositoryError> {
        Ok(self.guard()?.carts.get(&id).cloned())
    }

    async fn close_cart(&self, id: CartId, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut state = self.guard()?;
        match state.carts.get_mut(&id) {
            Some(cart) if cart.status == CartStatus::Open => {
                cart.status = CartStatus::Closed;
                cart.order_status = Some(OrderStatus::Placed);
                cart.closed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_order_status(
        &self,
        id: CartId,
        status: OrderStatus,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.guard()?;
        match state.carts.get_mut(&id) {
            Some(cart) if cart.status == CartStatus::Closed => {
                cart.order_status = Some(status);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cart_lines(&self, id: CartId) -> Result<Vec<CartLine>, RepositoryError> {
        let state = self.guard()?;
        Ok(state
            .items
            .values()
            .filter(|i| i.cart_id == id)
            .filter_map(|i| state.products.get(&i.product_id).map(|p| CartLine::new(i, p)))
            .collect())
    }

    async fn cart_item(&self, id: CartItemId) -> Result<Option<CartItem>, RepositoryError> {
        Ok(self.guard()?.items.get(&id).cloned())
    }

    async fn add_item(
        &self,
        cart: CartId,
        product: ProductId,
        quantity: i32,
    ) -> Result<Option<CartItem>, RepositoryError> {
        let mut state = self.guard()?;
        if !state.cart_is_open(cart) {
            return Ok(None);
        }
        if let Some(item) = state
            .items
            .values_mut()
            .find(|i| i.cart_id == cart && i.product_id == product)
        {
            item.quantity += quantity;
            return Ok(Some(item.clone()));
        }

        let item = CartItem {
            id: CartItemId::new(state.next_id()),
            cart_id: cart,
            product_id: product,
            quantity,
        };
        state.items.insert(item.id, item.clone());
        Ok(Some(item))
    }

    async fn set_item_quantity(
        &self,
        id: CartItemId,
        quantity: i32,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.guard()?;
        let Some(cart) = state.items.get(&id).map(|i| i.cart_id) else {
            return Ok(false);
        };
        if !state.cart_is_open(cart) {
            return Ok(false);
        }
        Ok(state.items.get_mut(&id).is_some_and(|item| {
            item.quantity = quantity;
            true
        }))
    }

    async fn remove_item(&self, id: CartItemId) -> Result<bool, RepositoryError> {
        let mut state = self.guard()?;
        let Some(cart) = state.items.get(&id).map(|i| i.cart_id) else {
            return Ok(false);
        };
        if !state.cart_is_open(cart) {
            return Ok(false);
        }
        Ok(state.items.remove(&id).is_some())
    }

    async fn clear_cart(&self, id: CartId) -> Result<u64, RepositoryError> {
        let mut state = self.guard()?;
        if !state.cart_is_open(id) {
            return Ok(0);
        }
        let before = state.items.len();
        state.items.retain(|_, i| i.cart_id != id);
        Ok(u64::try_from(before - state.items.len()).unwrap_or(u64::MAX))
    }

    async fn closed_carts(&self, user_id: Option<UserId>) -> Result<Vec<Cart>, RepositoryError> {
        let mut carts: Vec<Cart> = self
            .guard()?
            .carts
            .values()
            .filter(|c| c.status == CartStatus::Closed)
            .filter(|c| user_id.is_none_or(|u| c.user_id == u))
            .cloned()
            .collect();
        carts.sort_by(|a, b| (b.closed_at, b.id).cmp(&(a.closed_at, a.id)));
        Ok(carts)
    }

    async fn count_closed(&self) -> Result<i64, RepositoryError> {
        let count = self
            .guard()?
            .carts
            .values()
            .filter(|c| c.status == CartStatus::Closed)
            .count();
        Ok(i64::try_from(count).unwrap_or(i64::MAX))
    }
}

impl ProductCatalog for MemoryStore {
    async fn product_by_id(&self, id: ProductId) -> Result<Option<Product>, RepositoryError> {
        Ok(self.guard()?.products.get(&id).cloned())
    }

    async fn count_products(&self) -> Result<i64, RepositoryError> {
        Ok(i64::try_from(self.guard()?.products.len()).unwrap_or(i64::MAX))
    }
}

impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), RepositoryError> {
        self.guard().map(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pending(email: &str) -> NewSubject {
        NewSubject {
            email: Email::parse(email).unwrap(),
            name: "Test".to_string(),
            picture: None,
            password_hash: Some("$argon2id$stub".to_string()),
            external_id: None,
            status: SubjectStatus::Pending,
        }
    }

    fn value(byte: &str) -> TokenValue {
        TokenValue::parse(&byte.repeat(32)).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts() {
        let store = MemoryStore::new();
        store.create_subject(pending("a@gmail.com")).await.unwrap();
        let err = store.create_subject(pending("a@gmail.com")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_issue_supersedes_previous_token() {
        let store = MemoryStore::new();
        let (subject, first) = store
            .register_pending(pending("a@gmail.com"), value("aa"), Utc::now())
            .await
            .unwrap();

        let second = store
            .issue_token(NewToken {
                user_id: subject.id,
                purpose: TokenPurpose::ConfirmRegistration,
                value: value("bb"),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let first = store.token_by_value(&first.value).await.unwrap().unwrap();
        assert_eq!(first.status, TokenStatus::Expired);
        assert_eq!(second.status, TokenStatus::Unconfirmed);
        let latest = store
            .latest_token(subject.id, TokenPurpose::ConfirmRegistration)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[tokio::test]
    async fn test_reap_skips_confirmed_registration() {
        let store = MemoryStore::new();
        let (subject, token) = store
            .register_pending(pending("a@gmail.com"), value("aa"), Utc::now())
            .await
            .unwrap();

        assert!(store.confirm_registration(token.id, subject.id).await.unwrap());
        assert!(!store.reap_registration(token.id, subject.id).await.unwrap());
        assert!(store.subject_by_id(subject.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reap_cascades() {
        let store = MemoryStore::new();
        let (subject, token) = store
            .register_pending(pending("a@gmail.com"), value("aa"), Utc::now())
            .await
            .unwrap();
        store.create_open_cart(subject.id).await.unwrap();

        assert!(store.reap_registration(token.id, subject.id).await.unwrap());
        assert!(store.subject_by_id(subject.id).await.unwrap().is_none());
        assert_eq!(store.token_count(subject.id), 0);
        assert_eq!(store.open_cart_count(subject.id), 0);
    }

    #[tokio::test]
    async fn test_item_writes_skip_closed_carts() {
        let store = MemoryStore::new();
        let subject = store.create_subject(pending("a@gmail.com")).await.unwrap();
        let product = store.insert_product("Ring", Price::from_cents(1000).unwrap(), 10);
        let cart = store.create_open_cart(subject.id).await.unwrap();
        let item = store.add_item(cart.id, product.id, 1).await.unwrap().unwrap();
        assert!(store.close_cart(cart.id, Utc::now()).await.unwrap());

        assert!(store.add_item(cart.id, product.id, 3).await.unwrap().is_none());
        assert!(!store.set_item_quantity(item.id, 5).await.unwrap());
        assert!(!store.remove_item(item.id).await.unwrap());
        assert_eq!(store.clear_cart(cart.id).await.unwrap(), 0);

        let lines = store.cart_lines(cart.id).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].quantity, 1);
        assert_eq!(lines[0].subtotal, Price::from_cents(1000).unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_switch() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.count_subjects().await.unwrap_err();
        assert!(err.is_transient());
        store.set_unavailable(false);
        assert_eq!(store.count_subjects().await.unwrap(), 0);
    }
}
