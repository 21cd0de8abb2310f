//! On-chain call encoding: ERC-20 / ERC-4626 / bundler / executor plugin
//! interfaces, plus the Safe multisend wrapping used to batch the inner
//! transactions of a strategy run into one submission.

use alloy::primitives::{address, Address, Bytes, U256};
use alloy::sol_types::SolCall;

/// Safe MultiSendCallOnly singleton. Fixed deployment, same address on every
/// supported chain.
pub const SAFE_MULTISEND_CALL_ONLY: Address = address!("40a2accbd92bca938b02010e17a5b8929b49130d");

pub const OPERATION_CALL: u8 = 0;
pub const OPERATION_DELEGATE_CALL: u8 = 1;

alloy::sol! {
    interface IERC20 {
        function balanceOf(address owner) external view returns (uint256 balance);
        function approve(address spender, uint256 amount) external returns (bool);
        function transfer(address to, uint256 amount) external returns (bool);
    }

    interface IERC4626Vault {
        function balanceOf(address owner) external view returns (uint256 shares);
        function previewRedeem(uint256 shares) external view returns (uint256 assets);
        function previewDeposit(uint256 assets) external view returns (uint256 shares);
        function deposit(uint256 assets, address receiver) external returns (uint256 shares);
        function redeem(uint256 shares, address receiver, address owner) external returns (uint256 assets);
    }

    interface IBundler {
        function multicall(bytes[] calldata data) external payable;
        function erc20TransferFrom(address asset, uint256 amount) external payable;
        function erc4626Deposit(address vault, uint256 assets, uint256 minShares, address receiver) external payable;
        function erc4626Redeem(address vault, uint256 shares, uint256 minAssets, address receiver, address owner) external payable;
    }

    interface IExecutorPlugin {
        function executorNonce(address account, address executor) external view returns (uint256);
    }

    interface IMultiSend {
        function multiSend(bytes memory transactions) external payable;
    }
}

/// One inner transaction of a strategy bundle. Inner operations are always
/// plain calls; delegatecall never crosses this boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerTransaction {
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
}

impl InnerTransaction {
    pub fn call(target: Address, data: Vec<u8>) -> Self {
        Self {
            target,
            value: U256::ZERO,
            data: Bytes::from(data),
        }
    }
}

/// The outer transaction handed to the executor boundary: a single
/// `multiSend` delegatecall into the call-only singleton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeTransaction {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub operation: u8,
}

/// Pack inner transactions into the multisend wire format and wrap them in a
/// `multiSend` call. Layout per entry:
/// `operation (1) ∥ to (20) ∥ value (32) ∥ data.len (32) ∥ data`.
pub fn encode_multi_send(transactions: &[InnerTransaction]) -> SafeTransaction {
    let mut packed = Vec::new();
    for tx in transactions {
        packed.push(OPERATION_CALL);
        packed.extend_from_slice(tx.target.as_slice());
        packed.extend_from_slice(&tx.value.to_be_bytes::<32>());
        packed.extend_from_slice(&U256::from(tx.data.len()).to_be_bytes::<32>());
        packed.extend_from_slice(tx.data.as_ref());
    }

    let data = IMultiSend::multiSendCall {
        transactions: Bytes::from(packed),
    }
    .abi_encode();

    SafeTransaction {
        to: SAFE_MULTISEND_CALL_ONLY,
        value: U256::ZERO,
        data: Bytes::from(data),
        operation: OPERATION_DELEGATE_CALL,
    }
}

/// A bundler inner call, encoded through `encode_bundle` into one
/// `multicall(bytes[])` payload.
#[derive(Debug, Clone)]
pub enum BundlerCall {
    TransferFrom {
        asset: Address,
        amount: U256,
    },
    Deposit {
        vault: Address,
        assets: U256,
        min_shares: U256,
        receiver: Address,
    },
    Redeem {
        vault: Address,
        shares: U256,
        min_assets: U256,
        receiver: Address,
        owner: Address,
    },
}

pub fn encode_bundle(calls: &[BundlerCall]) -> Vec<u8> {
    let mut multicall = Vec::with_capacity(calls.len());
    for call in calls {
        let packed = match call {
            BundlerCall::TransferFrom { asset, amount } => IBundler::erc20TransferFromCall {
                asset: *asset,
                amount: *amount,
            }
            .abi_encode(),
            BundlerCall::Deposit {
                vault,
                assets,
                min_shares,
                receiver,
            } => IBundler::erc4626DepositCall {
                vault: *vault,
                assets: *assets,
                minShares: *min_shares,
                receiver: *receiver,
            }
            .abi_encode(),
            BundlerCall::Redeem {
                vault,
                shares,
                min_assets,
                receiver,
                owner,
            } => IBundler::erc4626RedeemCall {
                vault: *vault,
                shares: *shares,
                minAssets: *min_assets,
                receiver: *receiver,
                owner: *owner,
            }
            .abi_encode(),
        };
        multicall.push(Bytes::from(packed));
    }

    IBundler::multicallCall { data: multicall }.abi_encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn test_multi_send_packing_layout() {
        let token = address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");
        let inner = InnerTransaction::call(token, vec![0xde, 0xad, 0xbe, 0xef]);
        let safe_tx = encode_multi_send(&[inner.clone()]);

        assert_eq!(safe_tx.to, SAFE_MULTISEND_CALL_ONLY);
        assert_eq!(safe_tx.operation, OPERATION_DELEGATE_CALL);
        assert_eq!(safe_tx.value, U256::ZERO);
        assert_eq!(&safe_tx.data[..4], IMultiSend::multiSendCall::SELECTOR);

        let decoded =
            IMultiSend::multiSendCall::abi_decode(safe_tx.data.as_ref(), true).expect("decode");
        let packed = decoded.transactions.as_ref();
        // 1 op + 20 to + 32 value + 32 len + 4 data
        assert_eq!(packed.len(), 89);
        assert_eq!(packed[0], OPERATION_CALL);
        assert_eq!(&packed[1..21], token.as_slice());
        assert_eq!(U256::from_be_slice(&packed[21..53]), U256::ZERO);
        assert_eq!(U256::from_be_slice(&packed[53..85]), U256::from(4u64));
        assert_eq!(&packed[85..], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_multi_send_packs_in_order() {
        let a = InnerTransaction::call(
            address!("0000000000000000000000000000000000000001"),
            vec![0x01],
        );
        let b = InnerTransaction::call(
            address!("0000000000000000000000000000000000000002"),
            vec![0x02],
        );
        let safe_tx = encode_multi_send(&[a, b]);
        let decoded =
            IMultiSend::multiSendCall::abi_decode(safe_tx.data.as_ref(), true).expect("decode");
        let packed = decoded.transactions.as_ref();
        assert_eq!(packed.len(), 2 * 86);
        // first entry targets ...01, second ...02
        assert_eq!(packed[20], 0x01);
        assert_eq!(packed[86 + 20], 0x02);
    }

    #[test]
    fn test_encode_bundle_emits_multicall() {
        let vault = address!("0000000000000000000000000000000000000010");
        let token = address!("0000000000000000000000000000000000000020");
        let user = address!("0000000000000000000000000000000000000030");
        let encoded = encode_bundle(&[
            BundlerCall::TransferFrom {
                asset: token,
                amount: U256::from(100u64),
            },
            BundlerCall::Deposit {
                vault,
                assets: U256::from(100u64),
                min_shares: U256::from(99u64),
                receiver: user,
            },
        ]);

        assert_eq!(&encoded[..4], IBundler::multicallCall::SELECTOR);
        let decoded = IBundler::multicallCall::abi_decode(&encoded, true).expect("decode");
        assert_eq!(decoded.data.len(), 2);
        assert_eq!(
            &decoded.data[0][..4],
            IBundler::erc20TransferFromCall::SELECTOR
        );
        assert_eq!(&decoded.data[1][..4], IBundler::erc4626DepositCall::SELECTOR);
    }
}
