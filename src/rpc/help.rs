//! Usage strings and help text for the commands this server answers.

use super::error::RpcError;

struct CommandHelp {
    name: &'static str,
    usage: &'static str,
    description: &'static str,
}

const COMMANDS: &[CommandHelp] = &[
    CommandHelp {
        name: "addnode",
        usage: "addnode \"addr\" \"add|remove|onetry\"",
        description: "Attempts to add or remove a persistent peer.\n\n\
Arguments:\n1. addr (string, required) IP address and port of the peer to operate on\n\
2. subcmd (string, required) 'add' to add a persistent peer, 'remove' to remove a persistent peer, or 'onetry' to try a single connection to a peer\n\n\
Result:\nNothing",
    },
    CommandHelp {
        name: "estimatefee",
        usage: "estimatefee numblocks",
        description: "Estimate the fee per kilobyte in coins required for a transaction to be mined before a certain number of blocks have been generated.\n\n\
Arguments:\n1. numblocks (numeric, required) Maximum number of blocks until the transaction should be mined\n\n\
Result:\nn.nnn (numeric) Estimated fee per kilobyte in coins",
    },
    CommandHelp {
        name: "getaddednodeinfo",
        usage: "getaddednodeinfo dns (\"node\")",
        description: "Returns information about manually added (persistent) peers.\n\n\
Arguments:\n1. dns (boolean, required) Specifies whether the returned data is a JSON object including DNS and connection information, or just a list of added peers\n\
2. node (string, optional) Only return information about this specific peer instead of all added peers\n\n\
Result (dns=false):\n[\"peer\", ...] (array of string)\n\n\
Result (dns=true):\n[{\"addednode\": \"value\", \"connected\": true|false, \"addresses\": [{\"address\": \"value\", \"connected\": \"value\"}, ...]}, ...]",
    },
    CommandHelp {
        name: "getbestblock",
        usage: "getbestblock",
        description: "Get block height and hash of best block in the main chain.\n\n\
Result:\n{\"hash\": \"value\", \"height\": n}",
    },
    CommandHelp {
        name: "getbestblockhash",
        usage: "getbestblockhash",
        description: "Returns the hash of the best (most recent) block in the longest block chain.\n\n\
Result:\n\"value\" (string) The hex-encoded block hash",
    },
    CommandHelp {
        name: "getblock",
        usage: "getblock \"hash\" (verbose=true)",
        description: "Returns information about a block given its hash.\n\n\
Arguments:\n1. hash (string, required) The hash of the block\n\
2. verbose (boolean, optional, default=true) Specifies the block is returned as a JSON object instead of hex-encoded string\n\n\
Result (verbose=false):\n\"value\" (string) Hex-encoded bytes of the serialized block",
    },
    CommandHelp {
        name: "getblockchaininfo",
        usage: "getblockchaininfo",
        description: "Returns information about the current blockchain state and the status of any active soft-fork deployments.\n\n\
Result:\n{\"chain\": \"value\", \"blocks\": n, \"headers\": n, \"bestblockhash\": \"value\", \"difficulty\": n.nnn, \"mediantime\": n, \"pruned\": true|false, \"chainwork\": \"value\"}",
    },
    CommandHelp {
        name: "getblockcount",
        usage: "getblockcount",
        description: "Returns the number of blocks in the longest block chain.\n\n\
Result:\nn (numeric) The current block count",
    },
    CommandHelp {
        name: "getblockhash",
        usage: "getblockhash index",
        description: "Returns hash of the block in best block chain at the given height.\n\n\
Arguments:\n1. index (numeric, required) The block height\n\n\
Result:\n\"value\" (string) The block hash",
    },
    CommandHelp {
        name: "getblockheader",
        usage: "getblockheader \"hash\" (verbose=true)",
        description: "Returns information about a block header given its hash.\n\n\
Arguments:\n1. hash (string, required) The hash of the block\n\
2. verbose (boolean, optional, default=true) Specifies the block header is returned as a JSON object instead of hex-encoded string\n\n\
Result (verbose=false):\n\"value\" (string) The block header hash\n\n\
Result (verbose=true):\n{\"hash\": \"value\", \"confirmations\": n, \"height\": n, \"version\": n, \"versionHex\": \"value\", \"merkleroot\": \"value\", \"time\": n, \"nonce\": n, \"bits\": \"value\", \"difficulty\": n.nnn, \"previousblockhash\": \"value\", \"nextblockhash\": \"value\"}",
    },
    CommandHelp {
        name: "getblocktemplate",
        usage: "getblocktemplate ({\"mode\":\"value\",\"capabilities\":[\"value\",...],\"longpollid\":\"value\",\"data\":\"value\"})",
        description: "Returns a JSON object with information necessary to construct a block to mine or accepts a proposal to validate.\n\n\
See BIP0022 and BIP0023 for the full specification.\n\n\
Arguments:\n1. request (object, optional) Request object\n\n\
Result (mode=template):\nthe block template object\n\n\
Result (mode=proposal):\nnull when accepted, otherwise the rejection reason (string)",
    },
    CommandHelp {
        name: "getcfilter",
        usage: "getcfilter \"hash\" filtertype",
        description: "Returns a block's committed filter given its hash.\n\n\
Arguments:\n1. hash (string, required) The hash of the block\n\
2. filtertype (numeric, required) The type of filter to return (0=regular)\n\n\
Result:\n\"value\" (string) The block's committed filter",
    },
    CommandHelp {
        name: "getcfilterheader",
        usage: "getcfilterheader \"hash\" filtertype",
        description: "Returns a block's compact filter header given its hash.\n\n\
Arguments:\n1. hash (string, required) The hash of the block\n\
2. filtertype (numeric, required) The type of filter header to return (0=regular)\n\n\
Result:\n\"value\" (string) The block's compact filter header",
    },
    CommandHelp {
        name: "getconnectioncount",
        usage: "getconnectioncount",
        description: "Returns the number of active connections to other peers.\n\n\
Result:\nn (numeric) The number of connections",
    },
    CommandHelp {
        name: "getcurrentnet",
        usage: "getcurrentnet",
        description: "Get bitcoin network the server is running on.\n\n\
Result:\nn (numeric) The network identifier",
    },
    CommandHelp {
        name: "getdifficulty",
        usage: "getdifficulty",
        description: "Returns the proof-of-work difficulty as a multiple of the minimum difficulty.\n\n\
Result:\nn.nnn (numeric) The difficulty",
    },
    CommandHelp {
        name: "generate",
        usage: "generate numblocks",
        description: "Generates a set number of blocks (simnet or regtest only) and returns a JSON array of their hashes.\n\n\
Arguments:\n1. numblocks (numeric, required) Number of blocks to generate\n\n\
Result:\n[\"value\", ...] (array of string) The hashes, in order, of blocks generated by the call",
    },
    CommandHelp {
        name: "getgenerate",
        usage: "getgenerate",
        description: "Returns if the server is set to generate coins (mine) or not.\n\n\
Result:\ntrue|false (boolean) True if mining, false if not",
    },
    CommandHelp {
        name: "gethashespersec",
        usage: "gethashespersec",
        description: "Returns a recent hashes per second performance measurement while generating coins (mining).\n\n\
Result:\nn (numeric) The number of hashes per second",
    },
    CommandHelp {
        name: "getheaders",
        usage: "getheaders [\"blocklocator\",...] \"hashstop\"",
        description: "Returns block headers starting with the first known block hash from the request\n\n\
Arguments:\n1. blocklocators (array of string, required) JSON array of hex-encoded hashes of blocks.  Headers are returned starting from the first known hash in this list\n\
2. hashstop (string, required) Block hash to stop including block headers for; if not found, all headers to the latest known block are returned.\n\n\
Result:\n[\"value\", ...] (array of string) Serialized block headers of all located block headers",
    },
    CommandHelp {
        name: "getinfo",
        usage: "getinfo",
        description: "Returns a JSON object containing various state info.\n\n\
Result:\n{\"version\": n, \"protocolversion\": n, \"blocks\": n, \"timeoffset\": n, \"connections\": n, \"proxy\": \"host:port\", \"difficulty\": n.nnn, \"testnet\": true|false, \"relayfee\": n.nnn, \"errors\": \"errors\"}",
    },
    CommandHelp {
        name: "getmempoolinfo",
        usage: "getmempoolinfo",
        description: "Returns memory pool information.\n\n\
Result:\n{\"bytes\": n, \"size\": n}",
    },
    CommandHelp {
        name: "getmininginfo",
        usage: "getmininginfo",
        description: "Returns a JSON object containing mining-related information.\n\n\
Result:\n{\"blocks\": n, \"currentblocksize\": n, \"currentblockweight\": n, \"currentblocktx\": n, \"difficulty\": n.nnn, \"errors\": \"errors\", \"generate\": true|false, \"genthreads\": n, \"hashespersec\": n, \"pooledtx\": n, \"testnet\": true|false}",
    },
    CommandHelp {
        name: "getnettotals",
        usage: "getnettotals",
        description: "Returns a JSON object containing network traffic statistics.\n\n\
Result:\n{\"totalbytesrecv\": n, \"totalbytessent\": n, \"timemillis\": n}",
    },
    CommandHelp {
        name: "getnetworkhashps",
        usage: "getnetworkhashps (blocks=120 height=-1)",
        description: "Returns the estimated network hashes per second for the block heights provided by the parameters.\n\n\
Arguments:\n1. blocks (numeric, optional, default=120) The number of blocks, or -1 for blocks since last difficulty change\n\
2. height (numeric, optional, default=-1) Perform estimate ending with this height or -1 for current best chain block height\n\n\
Result:\nn (numeric) Estimated hashes per second",
    },
    CommandHelp {
        name: "getpeerinfo",
        usage: "getpeerinfo",
        description: "Returns data about each connected network peer as an array of json objects.\n\n\
Result:\n[{\"id\": n, \"addr\": \"host:port\", \"services\": \"flags\", ...}, ...]",
    },
    CommandHelp {
        name: "getrawmempool",
        usage: "getrawmempool (verbose=false)",
        description: "Returns information about all of the transactions currently in the memory pool.\n\n\
Arguments:\n1. verbose (boolean, optional, default=false) Returns JSON object when true or an array of transaction hashes when false\n\n\
Result:\n[\"value\", ...] (array of string) Array of transaction hashes",
    },
    CommandHelp {
        name: "getrawtransaction",
        usage: "getrawtransaction \"txid\" (verbose=0)",
        description: "Returns information about a transaction given its hash.\n\n\
Arguments:\n1. txid (string, required) The hash of the transaction\n\
2. verbose (numeric, optional, default=0) Specifies the transaction is returned as a JSON object instead of a hex-encoded string\n\n\
Result (verbose=0):\n\"value\" (string) Hex-encoded bytes of the serialized transaction\n\n\
Result (verbose=1):\nthe decoded transaction object",
    },
    CommandHelp {
        name: "gettxout",
        usage: "gettxout \"txid\" vout (includemempool=true)",
        description: "Returns information about an unspent transaction output.\n\n\
Arguments:\n1. txid (string, required) The hash of the transaction\n\
2. vout (numeric, required) The index of the output\n\
3. includemempool (boolean, optional, default=true) Include the mempool when true\n\n\
Result:\n{\"bestblock\": \"value\", \"confirmations\": n, \"value\": n.nnn, \"scriptPubKey\": {...}, \"coinbase\": true|false} or null when the output is spent or unknown",
    },
    CommandHelp {
        name: "help",
        usage: "help (\"command\")",
        description: "Returns a list of all commands or help for a specified command.\n\n\
Arguments:\n1. command (string, optional) The command to retrieve help for\n\n\
Result (no command specified):\n\"help text\" (string) List of commands\n\n\
Result (command specified):\n\"help text\" (string) Help for specified command",
    },
    CommandHelp {
        name: "node",
        usage: "node \"disconnect|remove|connect\" \"target\" (\"perm|temp\")",
        description: "Attempts to add or remove a peer.\n\n\
Arguments:\n1. subcmd (string, required) 'disconnect' to remove all matching non-persistent peers, 'remove' to remove a persistent peer, or 'connect' to connect to a peer\n\
2. target (string, required) Either the IP address and port of the peer to operate on, or a valid peer ID\n\
3. connectsubcmd (string, optional) 'perm' to make the connected peer a permanent one, 'temp' to try a single connect to a peer\n\n\
Result:\nNothing",
    },
    CommandHelp {
        name: "ping",
        usage: "ping",
        description: "Queues a ping to be sent to each connected peer.\n\
Ping times are provided by getpeerinfo via the pingtime and pingwait fields.\n\n\
Result:\nNothing",
    },
    CommandHelp {
        name: "sendrawtransaction",
        usage: "sendrawtransaction \"hextx\" (allowhighfees=false)",
        description: "Submits the serialized, hex-encoded transaction to the local peer and relays it to the network.\n\n\
Arguments:\n1. hextx (string, required) Serialized, hex-encoded signed transaction\n\
2. allowhighfees (boolean, optional, default=false) Whether or not to allow insanely high fees\n\n\
Result:\n\"value\" (string) The hash of the transaction",
    },
    CommandHelp {
        name: "setgenerate",
        usage: "setgenerate generate (genproclimit=-1)",
        description: "Set the server to generate coins (mine) or not.\n\n\
Arguments:\n1. generate (boolean, required) Use true to enable generation, false to disable it\n\
2. genproclimit (numeric, optional, default=-1) The number of worker processes to use for generation -- -1 for unlimited, 0 stops generation\n\n\
Result:\nNothing",
    },
    CommandHelp {
        name: "stop",
        usage: "stop",
        description: "Shutdown the node.\n\n\
Result:\n\"value\" (string) The string 'node stopping'",
    },
    CommandHelp {
        name: "submitblock",
        usage: "submitblock \"hexblock\" ({\"workid\":\"value\"})",
        description: "Attempts to submit a new serialized, hex-encoded block to the network.\n\n\
Arguments:\n1. hexblock (string, required) Serialized, hex-encoded block\n\
2. options (object, optional) Optional data that are currently unused\n\n\
Result (success):\nNothing\n\n\
Result (block rejected):\n\"value\" (string) The reason the block was rejected",
    },
    CommandHelp {
        name: "uptime",
        usage: "uptime",
        description: "Returns the total uptime of the server.\n\n\
Result:\nn (numeric) The number of seconds that the server has been running",
    },
    CommandHelp {
        name: "validateaddress",
        usage: "validateaddress \"address\"",
        description: "Verify an address is valid.\n\n\
Arguments:\n1. address (string, required) Bitcoin address to validate\n\n\
Result:\n{\"isvalid\": true|false, \"address\": \"value\"}",
    },
    CommandHelp {
        name: "version",
        usage: "version",
        description: "Returns the JSON-RPC API version (semver)\n\n\
Result:\n{\"podjsonrpcapi\": {\"versionstring\": \"value\", \"major\": n, \"minor\": n, \"patch\": n, \"prerelease\": \"value\", \"buildmetadata\": \"value\"}}",
    },
];

/// One usage line per command, sorted by name.
pub fn usage() -> String {
    let mut lines: Vec<&str> = COMMANDS.iter().map(|c| c.usage).collect();
    lines.sort_unstable();
    lines.join("\n")
}

/// Full help text for `method`.
pub fn method_help(method: &str) -> Result<String, RpcError> {
    COMMANDS
        .iter()
        .find(|c| c.name == method)
        .map(|c| format!("{}\n\n{}", c.usage, c.description))
        .ok_or_else(|| RpcError::invalid_parameter(format!("Unknown command: {}", method)))
}

/// Whether `method` has a help entry.
pub fn is_documented(method: &str) -> bool {
    COMMANDS.iter().any(|c| c.name == method)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_is_sorted() {
        let text = usage();
        let lines: Vec<&str> = text.lines().collect();
        let mut sorted = lines.clone();
        sorted.sort_unstable();
        assert_eq!(lines, sorted);
        assert!(text.contains("getblocktemplate"));
    }

    #[test]
    fn test_unknown_command() {
        let err = method_help("frobnicate").unwrap_err();
        assert_eq!(err.code, -8);
        assert_eq!(err.message, "Unknown command: frobnicate");
    }

    #[test]
    fn test_method_help_starts_with_usage() {
        let text = method_help("uptime").unwrap();
        assert!(text.starts_with("uptime\n\n"));
    }
}
