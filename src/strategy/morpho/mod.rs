//! Morpho rebalancing strategy activity.
//!
//! Per fire: discover candidate vaults, find the best one subject to
//! liquidity and whitelist constraints, decide between no-op / first deposit
//! / rebalance, build the bundled transaction, submit it through the
//! executor boundary, and record the execution log that seeds the next
//! run's yield computation.

pub mod config;
pub mod types;

pub use config::{MorphoConfig, StrategyParams};
pub use types::{AutomationState, ExecutionLog, ExecutionMetadata, TransitionState};

use crate::abi::{self, BundlerCall, IERC20, InnerTransaction, SafeTransaction};
use crate::engine::ActivityHandler;
use crate::error::StrategyError;
use crate::executor::{SignAndExecuteRequest, TaskSubmitter};
use crate::logs::{ExecutionLogRecord, ExecutionLogRepo};
use crate::oracle::PricingOracle;
use crate::schedule::ExecCtx;
use crate::vaults::{VaultChainReader, VaultIndex, VaultInfo};
use alloy::primitives::{Address, U256};
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Applied to previewed shares to absorb share-price movement between
/// preview and execution.
const SLIPPAGE: f64 = 0.9995;

/// Floor of `amount × fraction`, computed in fixed point so minor units
/// never round through a float.
fn mul_fraction(amount: U256, fraction: f64) -> U256 {
    if !(fraction.is_finite() && fraction > 0.0) {
        return U256::ZERO;
    }
    const SCALE: u64 = 1_000_000;
    let scaled = (fraction * SCALE as f64).round() as u64;
    amount * U256::from(scaled) / U256::from(SCALE)
}

/// Vault with the highest net APY among candidates whose underlying
/// liquidity strictly exceeds `min_liquidity`; zero address if none.
fn find_best_vault(vaults: &[VaultInfo], min_liquidity: U256) -> (Address, f64) {
    let mut best_vault = Address::ZERO;
    let mut best_apy = 0.0_f64;

    for vault in vaults {
        let Some(address) = vault.vault_address() else {
            continue;
        };
        if vault.state.net_apy > best_apy && vault.liquidity.underlying > min_liquidity {
            best_apy = vault.state.net_apy;
            best_vault = address;
        }
    }

    (best_vault, best_apy)
}

struct State {
    vaults: Vec<VaultInfo>,
    sub_account: Address,
    current_vault: Address,
    sub_account_balance: U256,
    min_underlying_liquidity: U256,
    has_available_balance: bool,
    is_already_in_vault: bool,
}

pub struct RebalancingStrategy {
    index: Arc<dyn VaultIndex>,
    chain: Arc<dyn VaultChainReader>,
    submitter: Arc<dyn TaskSubmitter>,
    logs: Arc<dyn ExecutionLogRepo>,
    oracle: Arc<dyn PricingOracle>,
    config: MorphoConfig,
    fee_receiver: Address,
    bundler_address: Address,
}

impl RebalancingStrategy {
    pub fn new(
        index: Arc<dyn VaultIndex>,
        chain: Arc<dyn VaultChainReader>,
        submitter: Arc<dyn TaskSubmitter>,
        logs: Arc<dyn ExecutionLogRepo>,
        oracle: Arc<dyn PricingOracle>,
        config: MorphoConfig,
    ) -> anyhow::Result<Self> {
        let fee_receiver = config.fee_receiver_address()?;
        let bundler_address = config.bundler()?;
        Ok(Self {
            index,
            chain,
            submitter,
            logs,
            oracle,
            config,
            fee_receiver,
            bundler_address,
        })
    }

    pub async fn execution_handler(&self, exec_ctx: ExecCtx) -> anyhow::Result<()> {
        let subscription = &exec_ctx.execute_workflow_params.params.subscription;
        let params: StrategyParams =
            serde_json::from_value(subscription.metadata.clone())
                .map_err(|err| StrategyError::MalformedParams(err.to_string()))?;
        let chain_id = exec_ctx.execute_workflow_params.params.chain_id;

        let state = self.initial_state(&exec_ctx, &params, chain_id).await?;
        let (best_vault, best_apy) =
            find_best_vault(&state.vaults, state.min_underlying_liquidity);

        if best_vault == state.current_vault {
            tracing::info!("no re-balance signal");
            return Ok(());
        }

        if !self.config.is_whitelisted(best_vault) {
            return Err(StrategyError::VaultNotWhitelisted(best_vault.to_checksum(None)).into());
        }

        if !state.is_already_in_vault && state.has_available_balance {
            tracing::info!(vault = %best_vault.to_checksum(None), net_apy = best_apy, "entering strategy");
            return self
                .deposit(&state, best_vault, &params, subscription.id.clone(), chain_id)
                .await;
        }

        if state.is_already_in_vault && best_vault != state.current_vault {
            tracing::info!(
                from = %state.current_vault.to_checksum(None),
                to = %best_vault.to_checksum(None),
                "re-balance strategy"
            );
            return self
                .rebalance(&state, best_vault, &params, subscription.id.clone(), chain_id)
                .await;
        }

        Ok(())
    }

    async fn initial_state(
        &self,
        exec_ctx: &ExecCtx,
        params: &StrategyParams,
        chain_id: u64,
    ) -> anyhow::Result<State> {
        let vaults = self.index.vaults(params.base_token, chain_id).await?;

        let sub_account = exec_ctx
            .execute_workflow_params
            .params
            .sub_account_address;
        let (current_vault, current_balance) = self.active_vault(sub_account, &vaults).await?;

        let sub_account_balance = self
            .chain
            .token_balance(params.base_token, sub_account)
            .await?;

        let mut min_underlying_liquidity = sub_account_balance;
        if let Some(current) = current_balance {
            if current > min_underlying_liquidity {
                min_underlying_liquidity = current;
            }
        }

        Ok(State {
            sub_account,
            current_vault,
            sub_account_balance,
            min_underlying_liquidity,
            has_available_balance: sub_account_balance > U256::ZERO,
            is_already_in_vault: current_vault != Address::ZERO,
            vaults,
        })
    }

    /// The first candidate vault the sub-account holds shares in, with its
    /// underlying value. Zero address when the account is in none of them.
    async fn active_vault(
        &self,
        sub_account: Address,
        vaults: &[VaultInfo],
    ) -> anyhow::Result<(Address, Option<U256>)> {
        for vault in vaults {
            let Some(address) = vault.vault_address() else {
                continue;
            };
            let shares = self.chain.shares(address, sub_account).await?;
            if shares != U256::ZERO {
                let balance = self.chain.preview_redeem(address, sub_account).await?;
                return Ok((address, Some(balance)));
            }
        }
        Ok((Address::ZERO, None))
    }

    async fn deposit(
        &self,
        state: &State,
        vault: Address,
        params: &StrategyParams,
        subscription_id: String,
        chain_id: u64,
    ) -> anyhow::Result<()> {
        let balance = state.sub_account_balance;
        let base_fee = self.calculate_base_fee(params.base_token, chain_id).await?;
        validate_balance(balance, base_fee)?;
        let deposit_amount = balance - base_fee;

        let transactions = vec![
            self.transfer_fee_txn(base_fee, params.base_token),
            self.approve_txn(deposit_amount, params.base_token),
            self.deposit_txn(state.sub_account, vault, deposit_amount, params.base_token)
                .await?,
        ];

        let log = self
            .submit(
                state.sub_account,
                chain_id,
                &transactions,
                ExecutionLog {
                    message: format!("Entered into strategy {}", vault.to_checksum(None)),
                    metadata: ExecutionMetadata {
                        req: None,
                        task_id: String::new(),
                        transition_state: TransitionState {
                            current: AutomationState {
                                target_vault: vault,
                                input_amount: deposit_amount.to_string(),
                                fees_amount: base_fee.to_string(),
                                generated_yield: "0".to_string(),
                            },
                            prev: None,
                        },
                    },
                },
            )
            .await?;

        self.persist_log(subscription_id, state.sub_account, chain_id, log)
            .await
    }

    async fn rebalance(
        &self,
        state: &State,
        to_vault: Address,
        params: &StrategyParams,
        subscription_id: String,
        chain_id: u64,
    ) -> anyhow::Result<()> {
        let sub_id = Uuid::parse_str(&subscription_id)
            .map_err(|err| anyhow::anyhow!("failed to parse subscription ID: {err}"))?;
        let latest = self
            .logs
            .latest_by_sub_id(sub_id)
            .await?
            .ok_or_else(|| StrategyError::MissingExecutionLog(subscription_id.clone()))?;
        let metadata: ExecutionMetadata = serde_json::from_value(latest.metadata)
            .map_err(|err| anyhow::anyhow!("failed to unmarshal metadata: {err}"))?;

        let from_vault = state.current_vault;
        let balance = self.chain.preview_redeem(from_vault, state.sub_account).await?;

        let prev_input = U256::from_str_radix(
            metadata.transition_state.current.input_amount.trim(),
            10,
        )
        .map_err(|_| {
            StrategyError::MalformedDepositAmount(
                metadata.transition_state.current.input_amount.clone(),
            )
        })?;

        // Yield may be zero or negative; only positive yield incurs a fee.
        let (yield_abs, yield_negative) = if balance >= prev_input {
            (balance - prev_input, false)
        } else {
            (prev_input - balance, true)
        };
        let generated_yield = if yield_negative {
            format!("-{yield_abs}")
        } else {
            yield_abs.to_string()
        };

        let mut base_fee = self.calculate_base_fee(params.base_token, chain_id).await?;
        if !yield_negative && yield_abs > U256::ZERO {
            base_fee += mul_fraction(yield_abs, self.config.yield_fees);
        }
        validate_balance(balance, base_fee)?;
        let deposit_amount = balance - base_fee;

        let transactions = vec![
            self.redeem_txn(from_vault, state.sub_account).await?,
            self.approve_txn(deposit_amount, params.base_token),
            self.deposit_txn(state.sub_account, to_vault, deposit_amount, params.base_token)
                .await?,
            self.transfer_fee_txn(base_fee, params.base_token),
        ];

        let log = self
            .submit(
                state.sub_account,
                chain_id,
                &transactions,
                ExecutionLog {
                    message: format!(
                        "Rebalanced shares from {} to {}",
                        from_vault.to_checksum(None),
                        to_vault.to_checksum(None)
                    ),
                    metadata: ExecutionMetadata {
                        req: None,
                        task_id: String::new(),
                        transition_state: TransitionState {
                            current: AutomationState {
                                target_vault: to_vault,
                                input_amount: deposit_amount.to_string(),
                                fees_amount: base_fee.to_string(),
                                generated_yield,
                            },
                            prev: Some(metadata.transition_state.current),
                        },
                    },
                },
            )
            .await?;

        self.persist_log(subscription_id, state.sub_account, chain_id, log)
            .await
    }

    /// Wrap the inner transactions into one multisend call, submit through
    /// the executor boundary, and finish the log with the task outcome.
    async fn submit(
        &self,
        sub_account: Address,
        chain_id: u64,
        transactions: &[InnerTransaction],
        mut log: ExecutionLog,
    ) -> anyhow::Result<ExecutionLog> {
        let safe_tx: SafeTransaction = abi::encode_multi_send(transactions);
        let req = SignAndExecuteRequest {
            subaccount: sub_account.to_checksum(None),
            chain_id,
            operation: safe_tx.operation,
            to: safe_tx.to.to_checksum(None),
            value: safe_tx.value.to_string(),
            data: format!("0x{}", hex::encode(safe_tx.data.as_ref())),
        };

        let task_id = self.submitter.execute(&req).await?;
        tracing::info!(task_id = %task_id, "executed strategy signal");

        log.metadata.task_id = task_id;
        log.metadata.req = Some(req);
        Ok(log)
    }

    async fn persist_log(
        &self,
        subscription_id: String,
        sub_account: Address,
        chain_id: u64,
        log: ExecutionLog,
    ) -> anyhow::Result<()> {
        let record = ExecutionLogRecord {
            id: Uuid::new_v4(),
            subscription_id: Uuid::parse_str(&subscription_id).unwrap_or_default(),
            chain_id,
            sub_account_address: sub_account.to_checksum(None),
            metadata: serde_json::to_value(&log.metadata)?,
            message: log.message,
            output_txn_hash: String::new(),
            created_at: Utc::now(),
        };
        self.logs.insert(&record).await
    }

    fn transfer_fee_txn(&self, base_fee: U256, base_token: Address) -> InnerTransaction {
        let calldata = IERC20::transferCall {
            to: self.fee_receiver,
            amount: base_fee,
        }
        .abi_encode();
        InnerTransaction::call(base_token, calldata)
    }

    fn approve_txn(&self, amount: U256, base_token: Address) -> InnerTransaction {
        let calldata = IERC20::approveCall {
            spender: self.bundler_address,
            amount,
        }
        .abi_encode();
        InnerTransaction::call(base_token, calldata)
    }

    async fn deposit_txn(
        &self,
        user: Address,
        vault: Address,
        deposit_amount: U256,
        base_token: Address,
    ) -> anyhow::Result<InnerTransaction> {
        let previewed = self.chain.preview_deposit(vault, deposit_amount).await?;
        let min_shares = mul_fraction(previewed, SLIPPAGE);
        tracing::info!(
            vault = %vault.to_checksum(None),
            input = %deposit_amount,
            shares = %min_shares,
            "calculated min deposit shares"
        );

        let calldata = abi::encode_bundle(&[
            BundlerCall::TransferFrom {
                asset: base_token,
                amount: deposit_amount,
            },
            BundlerCall::Deposit {
                vault,
                assets: deposit_amount,
                min_shares,
                receiver: user,
            },
        ]);
        Ok(InnerTransaction::call(self.bundler_address, calldata))
    }

    /// Redeem is encoded against the vault's own ABI and targeted at the
    /// vault, not the bundler: bundler redemption would need a prior share
    /// approval.
    async fn redeem_txn(
        &self,
        from_vault: Address,
        user: Address,
    ) -> anyhow::Result<InnerTransaction> {
        let calldata = self.chain.redeem_max_calldata(from_vault, user).await?;
        Ok(InnerTransaction::call(from_vault, calldata))
    }

    async fn calculate_base_fee(
        &self,
        base_token: Address,
        chain_id: u64,
    ) -> anyhow::Result<U256> {
        if let Some(exact) = self.config.exact_fee_for(base_token) {
            return U256::from_str_radix(exact.trim(), 10)
                .map_err(|_| StrategyError::MalformedFee(exact.to_string()).into());
        }

        // TODO(mainnet): derive from current gas price and configured gas
        // units instead of the flat USD conversion.
        self.oracle
            .convert_usd_to_token(chain_id, self.config.base_fees_in_usd, base_token)
            .await
    }
}

fn validate_balance(balance: U256, base_fee: U256) -> Result<(), StrategyError> {
    if balance <= base_fee {
        return Err(StrategyError::InsufficientBalance {
            want: base_fee.to_string(),
            have: balance.to_string(),
        });
    }
    Ok(())
}

/// Activity adapter: decodes the engine payload and runs the handler.
#[async_trait]
impl ActivityHandler for RebalancingStrategy {
    async fn run(&self, input: Value) -> anyhow::Result<Value> {
        let exec_ctx: ExecCtx = serde_json::from_value(input)
            .map_err(|err| anyhow::anyhow!("malformed execution context: {err}"))?;
        self.execution_handler(exec_ctx).await?;
        Ok(Value::Null)
    }
}
