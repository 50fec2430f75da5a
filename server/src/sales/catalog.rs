use uuid::Uuid;

use super::{CatalogError, Sales};
use crate::config::TenantContext;
use crate::models::catalog::to_cents;
use crate::models::{CategoryCode, PriceSold, ProductSold};
use crate::services::NewPrice;

impl Sales {
    /// Snapshots every product and price offered by an event and makes sure
    /// each snapshot is published to the payment provider.
    pub async fn materialize_event(
        &self,
        tenant: &TenantContext,
        event_id: Uuid,
    ) -> Result<Vec<PriceSold>, CatalogError> {
        let event = self.store.get_event(tenant, event_id).await?;
        let mut published = Vec::new();

        for product_id in &event.product_ids {
            let product = self.store.get_product(tenant, *product_id).await?;
            let (mut product_sold, created) = self
                .store
                .get_or_insert_product_sold(tenant, ProductSold::snapshot(&product, Some(event.uuid)))
                .await?;
            if product_sold.category == CategoryCode::None && product.category != CategoryCode::None {
                product_sold.category = product.category;
                self.store.update_product_sold(tenant, &product_sold).await?;
            }
            if created {
                tracing::info!(tenant = %tenant.slug(), event = %event.slug, product = %product.name, "Product snapshot created");
            }
            self.ensure_product_id(tenant, &mut product_sold, false).await?;

            for price in self.store.prices_for_product(tenant, product.uuid).await? {
                let (mut price_sold, _) = self
                    .store
                    .get_or_insert_price_sold(tenant, PriceSold::snapshot(&product_sold, &price))
                    .await?;
                self.ensure_price_id(tenant, &mut price_sold, false).await?;
                published.push(price_sold);
            }
        }
        Ok(published)
    }

    /// Returns the cached provider product id, creating the provider object
    /// when there is none or when `force` is set.
    pub async fn ensure_product_id(
        &self,
        tenant: &TenantContext,
        sold: &mut ProductSold,
        force: bool,
    ) -> Result<String, CatalogError> {
        if let (false, Some(id)) = (force, &sold.external_product_id) {
            return Ok(id.clone());
        }
        let product = self.store.get_product(tenant, sold.product_id).await?;
        let event = match sold.event_id {
            Some(event_id) => Some(self.store.get_event(tenant, event_id).await?),
            None => None,
        };
        let name = sold.nickname(&product, event.as_ref());
        let id = self
            .provider
            .create_product(tenant, &name, product.img_url.as_deref())
            .await?;
        tracing::info!(tenant = %tenant.slug(), product_sold = %sold.uuid, external = %id, "Provider product created");

        sold.external_product_id = Some(id.clone());
        self.store.update_product_sold(tenant, sold).await?;
        Ok(id)
    }

    /// Returns the cached provider price id, creating it on first use.
    ///
    /// The parent product is checked at the provider first and recreated if
    /// the provider no longer knows it.
    pub async fn ensure_price_id(
        &self,
        tenant: &TenantContext,
        sold: &mut PriceSold,
        force: bool,
    ) -> Result<String, CatalogError> {
        if let (false, Some(id)) = (force, &sold.external_price_id) {
            return Ok(id.clone());
        }
        let mut product_sold = self.store.get_product_sold(tenant, sold.product_sold_id).await?;
        let price = self.store.get_price(tenant, sold.price_id).await?;

        let mut product_id = self.ensure_product_id(tenant, &mut product_sold, false).await?;
        if !self.provider.product_exists(tenant, &product_id).await? {
            tracing::warn!(tenant = %tenant.slug(), external = %product_id, "Provider product missing, recreating");
            product_id = self.ensure_product_id(tenant, &mut product_sold, true).await?;
        }

        let id = self
            .provider
            .create_price(
                tenant,
                &NewPrice {
                    product: product_id,
                    unit_amount: to_cents(sold.amount),
                    currency: tenant.config().currency.clone(),
                    nickname: price.name.clone(),
                    recurring_interval: price.recurring_interval(),
                },
            )
            .await?;
        tracing::info!(tenant = %tenant.slug(), price_sold = %sold.uuid, external = %id, "Provider price created");

        sold.external_price_id = Some(id.clone());
        self.store.update_price_sold(tenant, sold).await?;
        Ok(id)
    }

    /// Forgets the provider price id so that the next checkout publishes
    /// the snapshot again. The snapshot becomes repriceable until then.
    pub async fn reset_price_id(&self, tenant: &TenantContext, price_sold_id: Uuid) -> Result<PriceSold, CatalogError> {
        let mut sold = self.store.get_price_sold(tenant, price_sold_id).await?;
        sold.external_price_id = None;
        self.store.update_price_sold(tenant, &sold).await?;
        tracing::info!(tenant = %tenant.slug(), price_sold = %sold.uuid, "Provider price id reset");
        Ok(sold)
    }

    /// Changes a snapshot's amount. Fails once it is published.
    pub async fn reprice(
        &self,
        tenant: &TenantContext,
        price_sold_id: Uuid,
        amount: rust_decimal::Decimal,
    ) -> Result<PriceSold, CatalogError> {
        let mut sold = self.store.get_price_sold(tenant, price_sold_id).await?;
        sold.reprice(amount)?;
        self.store.update_price_sold(tenant, &sold).await?;
        Ok(sold)
    }

    pub async fn event_is_full(&self, tenant: &TenantContext, event_id: Uuid) -> Result<bool, CatalogError> {
        let event = self.store.get_event(tenant, event_id).await?;
        let issued = self.store.count_issued_tickets(tenant, event_id).await?;
        Ok(event.is_full(issued))
    }
}
