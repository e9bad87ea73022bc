//! Bindings for the contracts the relay talks to. Only the functions and events we call are declared.

use alloy::{
    primitives::{Address, B256, FixedBytes, U256},
    sol,
};

/// ERC-165 interface id of ERC-721.
pub const ERC721_INTERFACE_ID: FixedBytes<4> = FixedBytes([0x80, 0xac, 0x58, 0xcd]);

sol! {
    #[sol(rpc)]
    interface IERC721 {
        function supportsInterface(bytes4 interfaceId) external view returns (bool supported);
        function ownerOf(uint256 tokenId) external view returns (address owner);
        function safeTransferFrom(address from, address to, uint256 tokenId) external;
        function tokenURI(uint256 tokenId) external view returns (string uri);
    }
}

sol! {
    #[sol(rpc)]
    interface IERC721IOU {
        function premintFor(address to) external;
        function mintedTokens() external view returns (uint256 count);
        function setTokenUri(uint256 tokenId, string memory uri) external;
    }
}

sol! {
    #[sol(rpc)]
    interface IBridge {
        event MigrationDeparturePreRegisteredERC721IOU(address indexed _signee, bytes32 migrationHash);

        function migrateToERC721IOU(
            address originWorld,
            uint256 originTokenId,
            bytes32 destinationUniverse,
            bytes32 destinationBridge,
            bytes32 destinationWorld,
            bytes32 destinationTokenId,
            bytes32 destinationOwner,
            bytes32 signee
        ) external;

        function getProofOfEscrowHash(bytes32 migrationHash) external view returns (bytes32 escrowHash);

        function registerEscrowHashSignature(bytes32 migrationHash, bytes calldata escrowHashSigned) external;

        function migrateFromIOUERC721ToERC721(
            bytes32 originUniverse,
            bytes32 originBridge,
            bytes32 originWorld,
            bytes32 originTokenId,
            bytes32 originOwner,
            address destinationWorld,
            uint256 destinationTokenId,
            address destinationOwner,
            address signee,
            bytes32 blockTimestamp,
            bytes calldata signedMessage
        ) external;
    }
}

/// Universe ids travel on-chain as their ASCII bytes, right-padded to a `bytes32`.
pub fn universe_key(unique_id: &str) -> Option<FixedBytes<32>> {
    let bytes = unique_id.as_bytes();
    if bytes.len() > 32 {
        return None;
    }
    let mut key = FixedBytes::<32>::ZERO;
    key[..bytes.len()].copy_from_slice(bytes);
    Some(key)
}

/// An address as the bridge takes it in a `bytes32` slot: left-padded with zeroes.
pub fn address_word(address: Address) -> B256 {
    address.into_word()
}

/// A number as the bridge takes it in a `bytes32` slot: big-endian.
pub fn number_word(value: U256) -> B256 {
    B256::from(value.to_be_bytes::<32>())
}
