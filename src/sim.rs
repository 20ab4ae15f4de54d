//! A scriptable, in-process [`BrokerGateway`]. Backs the scenario tests and paper/dry runs:
//! requests are recorded, and the test (or the dry-run harness) pushes whatever callbacks the
//! scenario calls for onto the same event channel a live gateway would use.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::broker::{
    BrokerEvent, BrokerGateway, BrokerOrder, ExecReport, ExecutionFilter, TickKind,
};
use crate::contract::{BrokerContractId, Contract, ContractKey};
use crate::error::Error;
use crate::execution::Side;

#[derive(Debug, Clone, PartialEq)]
/// One order as it crossed the gateway, kept for assertions.
pub struct PlacedOrder {
    /// The broker request id it went out under.
    pub req_id: i64,
    /// The shape.
    pub contract_key: ContractKey,
    /// The wire order.
    pub order: BrokerOrder,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    subscriptions: HashMap<i64, ContractKey>,
    placed: Vec<PlacedOrder>,
    cancels: Vec<i64>,
    contract_ids: HashMap<String, BrokerContractId>,
    next_contract_id: i64,
    positions: Vec<(String, ContractKey, f64, f64)>,
    queued_fills: Vec<ExecReport>,
    resolve_contracts: bool,
}

/// The simulated gateway. Cloneable through [`Arc`]; the paired receiver is the engine's
/// event stream.
pub struct SimGateway {
    inner: Mutex<Inner>,
    events: UnboundedSender<BrokerEvent>,
}

impl SimGateway {
    #[must_use]
    /// A fresh gateway and its event stream. Contract-details requests resolve automatically
    /// with sequential ids; call [`SimGateway::set_resolve_contracts`] to turn that off.
    pub fn new() -> (Arc<Self>, UnboundedReceiver<BrokerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                inner: Mutex::new(Inner {
                    resolve_contracts: true,
                    next_contract_id: 9000,
                    ..Inner::default()
                }),
                events: tx,
            }),
            rx,
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("sim gateway lock poisoned")
    }

    fn emit(&self, event: BrokerEvent) {
        // A dropped receiver just means the engine is shutting down.
        let _ = self.events.send(event);
    }

    // =================
    // === Scripting ===
    // =================

    /// Whether contract-details requests auto-resolve.
    pub fn set_resolve_contracts(&self, resolve: bool) {
        self.lock().resolve_contracts = resolve;
    }

    /// Push a bid/ask pair to every subscription on `key`.
    pub fn tick(&self, key: &ContractKey, bid: f64, ask: f64) {
        let req_ids: Vec<i64> = self
            .lock()
            .subscriptions
            .iter()
            .filter(|(_, k)| *k == key)
            .map(|(id, _)| *id)
            .collect();
        for req_id in req_ids {
            self.emit(BrokerEvent::TickPrice {
                req_id,
                kind: TickKind::Bid,
                price: bid,
            });
            self.emit(BrokerEvent::TickPrice {
                req_id,
                kind: TickKind::Ask,
                price: ask,
            });
        }
    }

    /// Deliver an execution immediately, the way unsolicited fill callbacks arrive.
    #[allow(clippy::too_many_arguments)]
    pub fn fill(
        &self,
        exec_id: &str,
        order_req_id: i64,
        key: &ContractKey,
        side: Side,
        shares: f64,
        price: f64,
        cum_qty: f64,
        time: DateTime<Utc>,
    ) {
        let report = ExecReport {
            exec_id: exec_id.to_owned(),
            order_request_id: order_req_id,
            contract_key: key.clone(),
            side,
            shares,
            price,
            avg_price: price,
            cum_qty,
            time,
        };
        self.emit(BrokerEvent::ExecDetails {
            req_id: order_req_id,
            report,
        });
        self.emit(BrokerEvent::ExecDetailsEnd {
            req_id: order_req_id,
        });
    }

    /// Queue an execution for delivery on the next `req_executions` call.
    pub fn queue_fill(&self, report: ExecReport) {
        self.lock().queued_fills.push(report);
    }

    /// Script a broker-side position, reported on account updates and position requests.
    pub fn set_position(&self, account: &str, key: &ContractKey, qty: f64, market_price: f64) {
        let mut inner = self.lock();
        inner
            .positions
            .retain(|(a, k, _, _)| !(a == account && k == key));
        inner
            .positions
            .push((account.to_owned(), key.clone(), qty, market_price));
    }

    // ==================
    // === Inspection ===
    // ==================

    #[must_use]
    /// Every order placed (including cancel-replaces), in order.
    pub fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.lock().placed.clone()
    }

    #[must_use]
    /// Every canceled request id, in order.
    pub fn cancels(&self) -> Vec<i64> {
        self.lock().cancels.clone()
    }

    #[must_use]
    /// The live subscription request id for `key`, if subscribed.
    pub fn subscription_for(&self, key: &ContractKey) -> Option<i64> {
        self.lock()
            .subscriptions
            .iter()
            .find(|(_, k)| *k == key)
            .map(|(id, _)| *id)
    }
}

impl BrokerGateway for SimGateway {
    fn connect(&self) -> Result<(), Error> {
        self.emit(BrokerEvent::NextValidId { order_id: 1 });
        Ok(())
    }

    fn next_id(&self) -> i64 {
        let mut inner = self.lock();
        inner.next_id += 1;
        inner.next_id
    }

    fn req_market_data(&self, req_id: i64, contract: &Contract) -> Result<(), Error> {
        self.lock().subscriptions.insert(req_id, contract.key());
        Ok(())
    }

    fn cancel_market_data(&self, req_id: i64) -> Result<(), Error> {
        self.lock().subscriptions.remove(&req_id);
        Ok(())
    }

    fn req_contract_details(&self, req_id: i64, contract: &Contract) -> Result<(), Error> {
        let id = {
            let mut inner = self.lock();
            if !inner.resolve_contracts {
                return Ok(());
            }
            let key = contract.key();
            let next = inner.next_contract_id + 1;
            let id = *inner
                .contract_ids
                .entry(key.as_str().to_owned())
                .or_insert_with(|| {
                    BrokerContractId(next)
                });
            inner.next_contract_id = inner.next_contract_id.max(id.0);
            id
        };
        self.emit(BrokerEvent::ContractDetails {
            req_id,
            contract_id: id,
        });
        self.emit(BrokerEvent::ContractDetailsEnd { req_id });
        Ok(())
    }

    fn place_order(&self, req_id: i64, contract: &Contract, order: &BrokerOrder) -> Result<(), Error> {
        self.lock().placed.push(PlacedOrder {
            req_id,
            contract_key: contract.key(),
            order: order.clone(),
        });
        Ok(())
    }

    fn cancel_order(&self, req_id: i64) -> Result<(), Error> {
        self.lock().cancels.push(req_id);
        Ok(())
    }

    fn req_executions(&self, req_id: i64, _filter: &ExecutionFilter) -> Result<(), Error> {
        let queued: Vec<ExecReport> = self.lock().queued_fills.drain(..).collect();
        for report in queued {
            self.emit(BrokerEvent::ExecDetails { req_id, report });
        }
        self.emit(BrokerEvent::ExecDetailsEnd { req_id });
        Ok(())
    }

    fn req_account_updates(&self, account: &str) -> Result<(), Error> {
        let rows: Vec<(String, ContractKey, f64, f64)> = self
            .lock()
            .positions
            .iter()
            .filter(|(a, ..)| a == account)
            .cloned()
            .collect();
        for (account, key, qty, price) in rows {
            self.emit(BrokerEvent::UpdatePortfolio {
                contract_key: key,
                position: qty,
                market_price: price,
                account,
            });
        }
        self.emit(BrokerEvent::AccountDownloadEnd {
            account: account.to_owned(),
        });
        Ok(())
    }

    fn req_positions(&self) -> Result<(), Error> {
        let rows: Vec<(String, ContractKey, f64, f64)> = self.lock().positions.clone();
        for (account, key, qty, _) in rows {
            self.emit(BrokerEvent::Position {
                contract_key: key,
                position: qty,
                account,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SimGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SimGateway(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_details_resolve_with_stable_ids() {
        let (gateway, mut events) = SimGateway::new();
        let contract = Contract::stock("SYM");
        gateway.req_contract_details(1, &contract).unwrap();
        gateway.req_contract_details(2, &contract).unwrap();

        let mut ids = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let BrokerEvent::ContractDetails { contract_id, .. } = event {
                ids.push(contract_id);
            }
        }
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1], "same shape, same broker id");
    }

    #[test]
    fn ticks_reach_all_subscriptions() {
        let (gateway, mut events) = SimGateway::new();
        let contract = Contract::stock("SYM");
        gateway.req_market_data(11, &contract).unwrap();
        gateway.tick(&contract.key(), 150.0, 150.2);

        let mut count = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, BrokerEvent::TickPrice { req_id: 11, .. }) {
                count += 1;
            }
        }
        assert_eq!(count, 2, "one bid and one ask");
    }
}
