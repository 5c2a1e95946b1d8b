use bitflags::bitflags;

bitflags! {
    /// The WebDAV verbs the handler can route.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DavMethod: u32 {
        const HEAD = 0x0001;
        const GET = 0x0002;
        const PUT = 0x0004;
        const PROPFIND = 0x0008;
        const PROPPATCH = 0x0010;
        const MKCOL = 0x0020;
        const COPY = 0x0040;
        const MOVE = 0x0080;
        const DELETE = 0x0100;
        const LOCK = 0x0200;
        const UNLOCK = 0x0400;

        const HTTP_RO = Self::HEAD.bits() | Self::GET.bits();
        const WEBDAV_RO = Self::HTTP_RO.bits() | Self::PROPFIND.bits();
    }
}

impl DavMethod {
    pub const WEBDAV_RW: DavMethod = DavMethod::all();
}
